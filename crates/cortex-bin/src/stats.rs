use cortex_config::CortexConfig;
use rusqlite::Connection;

/// Component database basenames, matching the persistence layout every
/// other crate's `open_component_db` call writes to under `data_dir`.
const COMPONENTS: &[&str] = &[
    "bpe_tokenizer",
    "word_embeddings",
    "sentence_embeddings",
    "learned_patterns",
    "knowledge_distillation",
    "chain_of_thought",
    "code_understanding",
    "conditional_gen",
    "cross_attention",
    "active_learning",
    "self_play",
    "meta_learning",
    "mixture_of_experts",
    "micro_transformer",
    "task_planner",
];

fn table_names(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table'
           AND name NOT LIKE 'sqlite_%'
           AND name NOT LIKE '%_fts_%'
           AND name NOT LIKE '%_fts'",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    rows.collect()
}

pub fn cmd_stats(config: &CortexConfig) -> cortex_core::Result<()> {
    let mut any_found = false;
    for component in COMPONENTS {
        let path = config.db_path(component);
        if !path.exists() {
            continue;
        }
        any_found = true;
        let conn = Connection::open(&path)?;
        let tables = table_names(&conn).unwrap_or_default();

        println!("{component}:");
        let mut total = 0i64;
        for table in &tables {
            let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |r| r.get(0)).unwrap_or(0);
            total += count;
            println!("  {table}: {count}");
        }
        println!("  total: {total}");
    }

    if !any_found {
        println!("no component databases found under {}", config.data_dir.display());
    }
    Ok(())
}
