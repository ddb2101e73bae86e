use once_cell::sync::Lazy;

use crate::Complexity;

#[derive(Debug, Clone)]
pub struct ChildTemplate {
    pub title: String,
    pub complexity: Complexity,
    pub depends_on_idx: Vec<usize>,
    pub children: Vec<ChildTemplate>,
}

fn t(title: &str, complexity: Complexity, deps: &[usize], children: Vec<ChildTemplate>) -> ChildTemplate {
    ChildTemplate { title: title.to_string(), complexity, depends_on_idx: deps.to_vec(), children }
}

fn leaf(title: &str, complexity: Complexity) -> ChildTemplate {
    t(title, complexity, &[], Vec::new())
}

#[derive(Debug, Clone)]
pub struct DecompositionTemplate {
    pub triggers: &'static [&'static str],
    pub root: &'static str,
    pub children: Vec<ChildTemplate>,
}

pub static TEMPLATES: Lazy<Vec<(&'static str, DecompositionTemplate)>> = Lazy::new(|| {
    vec![
        (
            "create_app",
            DecompositionTemplate {
                triggers: &["create app", "build application", "write a program", "build an app", "develop a"],
                root: "Create application",
                children: vec![
                    t(
                        "Design",
                        Complexity::Medium,
                        &[],
                        vec![
                            leaf("Gather requirements", Complexity::Simple),
                            leaf("Design the architecture", Complexity::Medium),
                            leaf("Choose the stack", Complexity::Simple),
                        ],
                    ),
                    t(
                        "Backend",
                        Complexity::Complex,
                        &[0],
                        vec![
                            leaf("Set up the environment", Complexity::Simple),
                            leaf("Create data models", Complexity::Medium),
                            leaf("Implement the API", Complexity::Medium),
                            leaf("Write tests", Complexity::Medium),
                        ],
                    ),
                    t(
                        "Frontend",
                        Complexity::Complex,
                        &[0],
                        vec![
                            leaf("Set up the UI framework", Complexity::Simple),
                            leaf("Build components", Complexity::Medium),
                            leaf("Wire up to the API", Complexity::Medium),
                        ],
                    ),
                    t(
                        "Deployment",
                        Complexity::Medium,
                        &[1, 2],
                        vec![leaf("Set up CI/CD", Complexity::Medium), leaf("Deploy", Complexity::Simple)],
                    ),
                ],
            },
        ),
        (
            "create_file",
            DecompositionTemplate {
                triggers: &["create file", "write file", "generate file", "create a file"],
                root: "Create file",
                children: vec![
                    leaf("Determine format and content", Complexity::Simple),
                    leaf("Create the file", Complexity::Simple),
                    leaf("Verify the result", Complexity::Trivial),
                ],
            },
        ),
        (
            "fix_bug",
            DecompositionTemplate {
                triggers: &["fix", "bug", "error", "not working", "broken", "crash"],
                root: "Fix the problem",
                children: vec![
                    leaf("Reproduce the issue", Complexity::Simple),
                    leaf("Find the root cause", Complexity::Medium),
                    leaf("Work out a fix", Complexity::Medium),
                    leaf("Apply the fix", Complexity::Simple),
                    t("Verify", Complexity::Simple, &[3], Vec::new()),
                ],
            },
        ),
        (
            "analyze_data",
            DecompositionTemplate {
                triggers: &["analyze", "analyse", "report", "statistics", "investigate"],
                root: "Analyze data",
                children: vec![
                    leaf("Collect the data", Complexity::Medium),
                    leaf("Clean and prepare", Complexity::Medium),
                    t("Run the analysis", Complexity::Complex, &[1], Vec::new()),
                    t("Write up results", Complexity::Simple, &[2], Vec::new()),
                ],
            },
        ),
        (
            "learn_topic",
            DecompositionTemplate {
                triggers: &["explain", "teach me", "what is", "tell me about", "how does"],
                root: "Explain the topic",
                children: vec![
                    leaf("Gauge the right level of depth", Complexity::Trivial),
                    leaf("Find good analogies", Complexity::Simple),
                    leaf("State the definition", Complexity::Simple),
                    leaf("Give examples", Complexity::Simple),
                    leaf("Check understanding", Complexity::Trivial),
                ],
            },
        ),
        (
            "refactor_code",
            DecompositionTemplate {
                triggers: &["refactor", "rewrite", "improve the code", "optimize", "clean up"],
                root: "Refactor code",
                children: vec![
                    leaf("Understand the current code", Complexity::Medium),
                    leaf("Identify problem areas", Complexity::Medium),
                    leaf("Plan the changes", Complexity::Simple),
                    t("Apply the refactor", Complexity::Complex, &[2], Vec::new()),
                    t("Confirm nothing broke", Complexity::Medium, &[3], Vec::new()),
                ],
            },
        ),
        (
            "setup_project",
            DecompositionTemplate {
                triggers: &["setup project", "initialize", "init project", "set up a project", "scaffold"],
                root: "Set up project",
                children: vec![
                    leaf("Create the directory structure", Complexity::Simple),
                    leaf("Set up dependencies", Complexity::Simple),
                    leaf("Configure the project", Complexity::Medium),
                    leaf("Create baseline files", Complexity::Simple),
                    t("Confirm the project builds", Complexity::Simple, &[1, 2, 3], Vec::new()),
                ],
            },
        ),
    ]
});

pub static COMPLEXITY_MARKERS: Lazy<Vec<(Complexity, &'static [&'static str])>> = Lazy::new(|| {
    vec![
        (Complexity::Trivial, &["trivial", "quick", "easy", "tiny", "one file"]),
        (Complexity::Simple, &["simple", "basic", "standard", "ordinary"]),
        (Complexity::Medium, &["medium", "typical", "normal"]),
        (Complexity::Complex, &["complex", "large", "multi-part", "architecture", "large-scale", "full", "production"]),
    ]
});
