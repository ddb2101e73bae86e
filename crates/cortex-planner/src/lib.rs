//! Decomposes a request into a tree of dependent tasks, orders the
//! leaves for execution, and learns new decompositions from
//! successful runs. Non-leaf tasks complete implicitly once every
//! child under them is done.

pub mod templates;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use cortex_core::db::open_component_db;
use cortex_core::Result;
use cortex_embeddings::{Level, SentenceEmbeddings, WordEmbeddings};
use cortex_reasoning::KnowledgeDistillation;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use templates::{ChildTemplate, COMPLEXITY_MARKERS, TEMPLATES};

const LEARNED_SIMILARITY_THRESHOLD: f32 = 0.8;
const LEARNED_LOOKUP_THRESHOLD: f32 = 0.5;
const REASONING_CONFIDENCE_FLOOR: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub parent_id: Option<Uuid>,
    pub depends_on: Vec<Uuid>,
    pub children: Vec<Uuid>,
    pub complexity: Complexity,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    pub fn is_ready(&self, completed: &std::collections::HashSet<Uuid>) -> bool {
        self.status == TaskStatus::Pending && self.depends_on.iter().all(|d| completed.contains(d))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub root_task: String,
    pub nodes: HashMap<Uuid, TaskNode>,
    pub execution_order: Vec<Uuid>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub created_at: DateTime<Utc>,
}

impl TaskPlan {
    pub fn progress(&self) -> f32 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.completed_tasks as f32 / self.total_tasks as f32 * 100.0
    }

    /// The next executable task: leaf, pending, with every dependency
    /// completed, walked in topological order.
    pub fn next_task(&self) -> Option<&TaskNode> {
        let completed: std::collections::HashSet<Uuid> = self
            .nodes
            .values()
            .filter(|n| n.status == TaskStatus::Completed)
            .map(|n| n.id)
            .collect();

        self.execution_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .find(|n| n.is_ready(&completed))
    }
}

pub struct TaskPlanner {
    conn: Connection,
    total_plans: u64,
    total_tasks_completed: u64,
}

impl TaskPlanner {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_component_db(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                root_task TEXT NOT NULL,
                plan_json TEXT NOT NULL,
                total_tasks INTEGER NOT NULL,
                completed_tasks INTEGER DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS learned_decompositions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_pattern TEXT NOT NULL,
                decomposition_json TEXT NOT NULL,
                usage_count INTEGER DEFAULT 1,
                success_rate REAL DEFAULT 1.0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS planner_stats (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        let mut planner = Self { conn, total_plans: 0, total_tasks_completed: 0 };
        planner.load_stats()?;
        Ok(planner)
    }

    fn load_stats(&mut self) -> Result<()> {
        for (key, slot) in [("total_plans", &mut self.total_plans), ("total_tasks_completed", &mut self.total_tasks_completed)] {
            let value: Option<String> = self
                .conn
                .query_row("SELECT value FROM planner_stats WHERE key = ?1", params![key], |r| r.get(0))
                .optional()?;
            if let Some(v) = value {
                *slot = v.parse().unwrap_or(0);
            }
        }
        Ok(())
    }

    fn save_stats(&self) -> Result<()> {
        for (key, value) in [("total_plans", self.total_plans.to_string()), ("total_tasks_completed", self.total_tasks_completed.to_string())] {
            self.conn.execute(
                "INSERT INTO planner_stats (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        Ok(())
    }

    /// Builds a full plan for `task_description`: finds a decomposition
    /// (builtin template, learned template, or a reasoning chain from
    /// knowledge distillation), builds the task tree, and computes the
    /// leaf execution order.
    pub fn plan(
        &mut self,
        task_description: &str,
        kd: &mut KnowledgeDistillation,
        sentences: &mut SentenceEmbeddings,
        words: &mut WordEmbeddings,
    ) -> Result<TaskPlan> {
        self.total_plans += 1;
        let now = Utc::now();

        let mut plan = match self.find_template(task_description, kd, sentences, words)? {
            Some((root_title, children)) => Self::build_from_template(task_description, &root_title, &children, now),
            None => Self::build_simple_plan(task_description, now),
        };
        plan.execution_order = Self::topological_sort(&plan);

        self.conn.execute(
            "INSERT INTO plans (root_task, plan_json, total_tasks, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_description, serde_json::to_string(&plan)?, plan.total_tasks as i64, now.to_rfc3339()],
        )?;
        self.save_stats()?;

        tracing::info!(task = %task_description, total_tasks = plan.total_tasks, "built plan");
        Ok(plan)
    }

    fn find_template(
        &mut self,
        task_description: &str,
        kd: &mut KnowledgeDistillation,
        sentences: &mut SentenceEmbeddings,
        words: &mut WordEmbeddings,
    ) -> Result<Option<(String, Vec<ChildTemplate>)>> {
        let text = task_description.to_lowercase();
        let mut best_score = 0usize;
        let mut best: Option<(String, Vec<ChildTemplate>)> = None;
        for (key, entry) in TEMPLATES.iter() {
            let score = entry.triggers.iter().filter(|trigger| text.contains(**trigger)).count();
            if score > best_score {
                best_score = score;
                best = Some((entry.root.to_string(), entry.children.clone()));
            }
            let _ = key;
        }
        if best.is_some() {
            return Ok(best);
        }

        if let Some(learned) = self.find_learned_decomposition(task_description, sentences, words)? {
            return Ok(Some(("Complete the task".to_string(), learned)));
        }

        if let Some(reasoning) = kd.find_reasoning(task_description, None)? {
            if reasoning.confidence >= REASONING_CONFIDENCE_FLOOR && reasoning.steps.len() >= 2 {
                let children = reasoning
                    .steps
                    .iter()
                    .map(|s| ChildTemplate { title: s.clone(), complexity: Complexity::Medium, depends_on_idx: Vec::new(), children: Vec::new() })
                    .collect();
                return Ok(Some(("Complete the task".to_string(), children)));
            }
        }

        Ok(None)
    }

    fn find_learned_decomposition(
        &self,
        task_description: &str,
        sentences: &mut SentenceEmbeddings,
        words: &mut WordEmbeddings,
    ) -> Result<Option<Vec<ChildTemplate>>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_pattern, decomposition_json FROM learned_decompositions
             WHERE success_rate >= 0.5 ORDER BY usage_count DESC LIMIT 20",
        )?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let mut best: Option<(f32, String)> = None;
        for (pattern, json) in rows {
            let sim = sentences.similarity(task_description, &pattern, Level::Positional, words);
            if best.as_ref().map(|(s, _)| sim > *s).unwrap_or(true) {
                best = Some((sim, json));
            }
        }

        match best {
            Some((sim, json)) if sim >= LEARNED_LOOKUP_THRESHOLD => {
                let titles: Vec<String> = serde_json::from_str(&json).unwrap_or_default();
                Ok(Some(
                    titles
                        .into_iter()
                        .map(|title| ChildTemplate { title, complexity: Complexity::Medium, depends_on_idx: Vec::new(), children: Vec::new() })
                        .collect(),
                ))
            }
            _ => Ok(None),
        }
    }

    fn build_from_template(task_description: &str, root_title: &str, children: &[ChildTemplate], now: DateTime<Utc>) -> TaskPlan {
        let mut nodes = HashMap::new();
        let root_id = Uuid::new_v4();
        let root = TaskNode {
            id: root_id,
            title: root_title.to_string(),
            description: task_description.to_string(),
            status: TaskStatus::Pending,
            priority: TaskPriority::High,
            parent_id: None,
            depends_on: Vec::new(),
            children: Vec::new(),
            complexity: Complexity::Complex,
            result: None,
            created_at: now,
            completed_at: None,
        };
        nodes.insert(root_id, root);

        let mut child_ids = Vec::new();
        for child in children {
            let id = Self::build_node(child, Some(root_id), &child_ids, now, &mut nodes);
            child_ids.push(id);
        }
        if let Some(root) = nodes.get_mut(&root_id) {
            root.children = child_ids;
        }

        TaskPlan {
            root_task: task_description.to_string(),
            total_tasks: nodes.len(),
            nodes,
            execution_order: Vec::new(),
            completed_tasks: 0,
            created_at: now,
        }
    }

    fn build_node(
        template: &ChildTemplate,
        parent_id: Option<Uuid>,
        sibling_ids: &[Uuid],
        now: DateTime<Utc>,
        nodes: &mut HashMap<Uuid, TaskNode>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let depends_on: Vec<Uuid> = template.depends_on_idx.iter().filter_map(|i| sibling_ids.get(*i).copied()).collect();

        let mut child_ids = Vec::new();
        for child in &template.children {
            let child_id = Self::build_node(child, Some(id), &child_ids, now, nodes);
            child_ids.push(child_id);
        }

        nodes.insert(
            id,
            TaskNode {
                id,
                title: template.title.to_string(),
                description: String::new(),
                status: TaskStatus::Pending,
                priority: TaskPriority::Medium,
                parent_id,
                depends_on,
                children: child_ids,
                complexity: template.complexity,
                result: None,
                created_at: now,
                completed_at: None,
            },
        );
        id
    }

    fn build_simple_plan(task_description: &str, now: DateTime<Utc>) -> TaskPlan {
        let complexity = Self::estimate_complexity(task_description);
        let mut nodes = HashMap::new();
        let root_id = Uuid::new_v4();

        let mut root = TaskNode {
            id: root_id,
            title: task_description.to_string(),
            description: task_description.to_string(),
            status: TaskStatus::Pending,
            priority: TaskPriority::High,
            parent_id: None,
            depends_on: Vec::new(),
            children: Vec::new(),
            complexity,
            result: None,
            created_at: now,
            completed_at: None,
        };

        if matches!(complexity, Complexity::Medium | Complexity::Complex) {
            let steps = [("Understand the task", Complexity::Simple), ("Execute", Complexity::Medium), ("Verify the result", Complexity::Simple)];
            let mut prev_id = None;
            for (title, step_complexity) in steps {
                let id = Uuid::new_v4();
                let depends_on = prev_id.map(|p| vec![p]).unwrap_or_default();
                nodes.insert(
                    id,
                    TaskNode {
                        id,
                        title: title.to_string(),
                        description: String::new(),
                        status: TaskStatus::Pending,
                        priority: TaskPriority::Medium,
                        parent_id: Some(root_id),
                        depends_on,
                        children: Vec::new(),
                        complexity: step_complexity,
                        result: None,
                        created_at: now,
                        completed_at: None,
                    },
                );
                root.children.push(id);
                prev_id = Some(id);
            }
        }

        nodes.insert(root_id, root);
        TaskPlan { root_task: task_description.to_string(), total_tasks: nodes.len(), nodes, execution_order: Vec::new(), completed_tasks: 0, created_at: now }
    }

    fn estimate_complexity(task: &str) -> Complexity {
        let text = task.to_lowercase();
        for (complexity, markers) in COMPLEXITY_MARKERS.iter() {
            if markers.iter().any(|m| text.contains(m)) {
                return *complexity;
            }
        }
        if task.len() > 100 {
            Complexity::Complex
        } else if task.len() > 40 {
            Complexity::Medium
        } else {
            Complexity::Simple
        }
    }

    /// Leaf-only topological sort (Kahn's algorithm): non-leaf nodes
    /// complete implicitly when all their children complete, so only
    /// leaves are actually scheduled for execution.
    fn topological_sort(plan: &TaskPlan) -> Vec<Uuid> {
        let leaves: Vec<Uuid> = plan.nodes.values().filter(|n| n.children.is_empty()).map(|n| n.id).collect();
        let leaf_set: std::collections::HashSet<Uuid> = leaves.iter().copied().collect();

        let mut in_degree: HashMap<Uuid, usize> = leaves
            .iter()
            .map(|id| (*id, plan.nodes[id].depends_on.iter().filter(|d| leaf_set.contains(d)).count()))
            .collect();

        let mut queue: Vec<Uuid> = leaves.iter().copied().filter(|id| in_degree[id] == 0).collect();
        queue.sort_by_key(|id| plan.nodes[id].priority);

        let mut order = Vec::new();
        let mut visited = std::collections::HashSet::new();

        while !queue.is_empty() {
            let current = queue.remove(0);
            if !visited.insert(current) {
                continue;
            }
            order.push(current);

            for id in &leaves {
                if visited.contains(id) {
                    continue;
                }
                if plan.nodes[id].depends_on.contains(&current) {
                    let d = in_degree.entry(*id).or_insert(1);
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        queue.push(*id);
                    }
                }
            }
            queue.sort_by_key(|id| plan.nodes[id].priority);
        }

        for id in leaves {
            if !visited.contains(&id) {
                order.push(id);
            }
        }
        order
    }

    /// Marks a task completed (or failed) and walks upward, completing
    /// any parent whose children are now all done.
    pub fn complete_task(&mut self, plan: &mut TaskPlan, task_id: Uuid, result: String, success: bool) {
        let Some(node) = plan.nodes.get_mut(&task_id) else { return };
        node.status = if success { TaskStatus::Completed } else { TaskStatus::Failed };
        node.result = Some(result);
        node.completed_at = Some(Utc::now());
        plan.completed_tasks += 1;
        self.total_tasks_completed += 1;

        let mut parent_id = plan.nodes[&task_id].parent_id;
        while let Some(pid) = parent_id {
            let children_done = {
                let parent = &plan.nodes[&pid];
                parent.children.iter().all(|cid| plan.nodes.get(cid).map(|c| c.status == TaskStatus::Completed).unwrap_or(true))
            };
            if !children_done {
                break;
            }
            let parent = plan.nodes.get_mut(&pid).unwrap();
            parent.status = TaskStatus::Completed;
            parent.completed_at = Some(Utc::now());
            parent_id = parent.parent_id;
        }
    }

    /// Stores or reinforces a decomposition learned from a successful
    /// (or failed) LLM-driven run, keyed by semantic similarity to
    /// previously learned patterns.
    pub fn learn_decomposition(
        &mut self,
        task_description: &str,
        step_titles: &[String],
        success: bool,
        sentences: &mut SentenceEmbeddings,
        words: &mut WordEmbeddings,
    ) -> Result<()> {
        let now = Utc::now();
        let mut stmt = self.conn.prepare("SELECT id, task_pattern FROM learned_decompositions")?;
        let rows: Vec<(i64, String)> = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?.filter_map(|r| r.ok()).collect();

        let mut existing = None;
        for (id, pattern) in rows {
            if sentences.similarity(task_description, &pattern, Level::Positional, words) >= LEARNED_SIMILARITY_THRESHOLD {
                existing = Some(id);
                break;
            }
        }

        if let Some(id) = existing {
            let delta = if success { 0.1 } else { -0.2 };
            self.conn.execute(
                "UPDATE learned_decompositions SET usage_count = usage_count + 1,
                 success_rate = MAX(0, MIN(1, success_rate + ?1)), updated_at = ?2 WHERE id = ?3",
                params![delta, now.to_rfc3339(), id],
            )?;
        } else {
            self.conn.execute(
                "INSERT INTO learned_decompositions (task_pattern, decomposition_json, success_rate, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_description, serde_json::to_string(step_titles)?, if success { 1.0 } else { 0.5 }, now.to_rfc3339(), now.to_rfc3339()],
            )?;
        }
        Ok(())
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.total_plans, self.total_tasks_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_embeddings::{SentenceEmbeddings, WordEmbeddings};
    use cortex_reasoning::KnowledgeDistillation;

    fn setup() -> (TaskPlanner, KnowledgeDistillation, SentenceEmbeddings, WordEmbeddings, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let planner = TaskPlanner::open(&dir.path().join("planner.db")).unwrap();
        let kd = KnowledgeDistillation::open(&dir.path().join("kd.db")).unwrap();
        let words = WordEmbeddings::open(&dir.path().join("words.db"), 32).unwrap();
        let sentences = SentenceEmbeddings::open(&dir.path().join("sentences.db"), 32).unwrap();
        (planner, kd, sentences, words, dir)
    }

    #[test]
    fn create_file_matches_builtin_template() {
        let (mut planner, mut kd, mut sentences, mut words, _dir) = setup();
        let plan = planner.plan("please create a file for me", &mut kd, &mut sentences, &mut words).unwrap();
        assert!(plan.total_tasks >= 4);
        assert!(plan.nodes.values().any(|n| n.title == "Create the file"));
    }

    #[test]
    fn execution_order_respects_dependencies() {
        let (mut planner, mut kd, mut sentences, mut words, _dir) = setup();
        let plan = planner.plan("fix this bug please", &mut kd, &mut sentences, &mut words).unwrap();

        let verify_idx = plan.execution_order.iter().position(|id| plan.nodes[id].title == "Verify").unwrap();
        let apply_idx = plan.execution_order.iter().position(|id| plan.nodes[id].title == "Apply the fix").unwrap();
        assert!(apply_idx < verify_idx);
    }

    #[test]
    fn complete_task_walks_up_to_parent() {
        let (mut planner, mut kd, mut sentences, mut words, _dir) = setup();
        let mut plan = planner.plan("create a file", &mut kd, &mut sentences, &mut words).unwrap();

        let root_id = plan.nodes.values().find(|n| n.parent_id.is_none()).unwrap().id;
        let child_ids = plan.nodes[&root_id].children.clone();
        for cid in &child_ids {
            planner.complete_task(&mut plan, *cid, "done".to_string(), true);
        }
        assert_eq!(plan.nodes[&root_id].status, TaskStatus::Completed);
    }

    #[test]
    fn unknown_task_falls_back_to_simple_plan() {
        let (mut planner, mut kd, mut sentences, mut words, _dir) = setup();
        let plan = planner
            .plan("xyzzy plugh frobnicate the qux widget thoroughly and completely with great care", &mut kd, &mut sentences, &mut words)
            .unwrap();
        assert!(plan.total_tasks >= 1);
    }
}
