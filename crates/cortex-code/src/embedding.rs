use crate::analysis::CodeAnalysis;

/// AST-level node kinds tracked as a bag-of-words style histogram.
/// This is not an exhaustive grammar, just the constructs common
/// enough in real code to be discriminative for similarity search.
const NODE_KINDS: &[&str] = &[
    "def", "async def", "class", "if", "elif", "else", "for", "while", "try", "except",
    "finally", "with", "return", "yield", "raise", "assert", "import", "from import",
    "lambda", "global", "nonlocal", "del", "pass", "break", "continue", "and", "or",
    "not", "in", "is", "None", "True", "False", "self", "print", "list comprehension",
    "dict comprehension", "set comprehension", "generator expression", "f-string",
    "decorator", "star args", "double star kwargs", "slice", "unpacking", "walrus",
    "match", "case", "async for", "async with", "await", "type hint", "dataclass",
    "property", "staticmethod", "classmethod", "abstractmethod", "super", "init",
];

pub const EMBEDDING_DIM: usize = NODE_KINDS.len() + 8;

fn count_occurrences(source: &str, kind: &str) -> usize {
    match kind {
        "list comprehension" => source.matches("[").count().min(source.matches("for ").count()),
        "dict comprehension" | "set comprehension" => 0,
        "f-string" => source.matches("f\"").count() + source.matches("f'").count(),
        "star args" => source.matches("*args").count(),
        "double star kwargs" => source.matches("**kwargs").count(),
        "decorator" => source.matches('@').count(),
        "walrus" => source.matches(":=").count(),
        "type hint" => source.matches("->").count(),
        "init" => source.matches("__init__").count(),
        "super" => source.matches("super(").count(),
        _ => source.matches(kind).count(),
    }
}

/// Produces a fixed-dimension embedding for a source file: one slot
/// per tracked AST node kind plus eight structural summary features,
/// suitable for cosine similarity search against other files.
pub fn embed(source: &str, analysis: &CodeAnalysis) -> Vec<f32> {
    let mut vec = Vec::with_capacity(EMBEDDING_DIM);

    let total_lines = analysis.line_count.max(1) as f32;
    for kind in NODE_KINDS {
        let raw = count_occurrences(source, kind) as f32;
        vec.push((raw / total_lines).min(5.0));
    }

    let line_count_feature = (analysis.line_count as f32 + 1.0).ln();
    let fn_count = analysis.functions.len() as f32;
    let class_count = analysis.classes.len() as f32;
    let import_count = analysis.imports.len() as f32;
    let max_depth = analysis
        .functions
        .iter()
        .map(|f| (f.end_line.saturating_sub(f.start_line)) as f32)
        .fold(0.0_f32, f32::max)
        .ln_1p();
    let loop_lines = source.lines().filter(|l| l.trim_start().starts_with("for ") || l.trim_start().starts_with("while ")).count() as f32;
    let cond_lines = source.lines().filter(|l| l.trim_start().starts_with("if ") || l.trim_start().starts_with("elif ")).count() as f32;
    let loop_fraction = loop_lines / total_lines;
    let cond_fraction = cond_lines / total_lines;
    let async_presence = if analysis.functions.iter().any(|f| f.is_async) { 1.0 } else { 0.0 };

    vec.push(line_count_feature);
    vec.push(fn_count.ln_1p());
    vec.push(class_count.ln_1p());
    vec.push(import_count.ln_1p());
    vec.push(max_depth);
    vec.push(loop_fraction);
    vec.push(cond_fraction);
    vec.push(async_presence);

    vec
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze;

    #[test]
    fn embedding_has_fixed_dimension() {
        let src = "def f(x):\n    return x\n";
        let analysis = analyze(src);
        let v = embed(src, &analysis);
        assert_eq!(v.len(), EMBEDDING_DIM);
    }

    #[test]
    fn similar_files_score_higher_than_dissimilar() {
        let a = "def f(x):\n    if x:\n        return x\n    return 0\n";
        let b = "def g(y):\n    if y:\n        return y\n    return 0\n";
        let c = "class Thing:\n    def __init__(self):\n        self.value = 1\n";

        let aa = analyze(a);
        let ab = analyze(b);
        let ac = analyze(c);
        let ea = embed(a, &aa);
        let eb = embed(b, &ab);
        let ec = embed(c, &ac);

        assert!(cosine_similarity(&ea, &eb) > cosine_similarity(&ea, &ec));
    }
}
