use once_cell::sync::Lazy;
use regex::Regex;
use rustpython_parser::{ast, Parse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyFunction {
    pub name: String,
    pub args: Vec<String>,
    pub return_annotation: Option<String>,
    pub docstring: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub cyclomatic_complexity: u32,
    pub decorators: Vec<String>,
    pub calls: Vec<String>,
    pub is_async: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyClass {
    pub name: String,
    pub bases: Vec<String>,
    pub methods: Vec<String>,
    pub attributes: Vec<String>,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportStmt {
    pub module: String,
    pub names: Vec<String>,
    pub is_from: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiPattern {
    pub kind: String,
    pub location: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeAnalysis {
    pub functions: Vec<PyFunction>,
    pub classes: Vec<PyClass>,
    pub imports: Vec<ImportStmt>,
    pub anti_patterns: Vec<AntiPattern>,
    pub line_count: usize,
    pub summary: String,
}

const LONG_FUNCTION_LINES: usize = 50;
const MANY_ARGS: usize = 5;
const HIGH_COMPLEXITY: u32 = 10;

fn indent_of(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ').count()
}

/// Finds the line range `[start, end)` of the block that opens at
/// `def_line` (0-indexed), by scanning forward until a line at the
/// same or shallower indentation appears.
fn block_end(lines: &[&str], def_line: usize) -> usize {
    let base_indent = indent_of(lines[def_line]);
    for (i, line) in lines.iter().enumerate().skip(def_line + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= base_indent {
            return i;
        }
    }
    lines.len()
}

fn extract_docstring(lines: &[&str], body_start: usize, body_end: usize) -> Option<String> {
    static DOCSTRING: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^\s*(?:"""|''')(.*?)(?:"""|''')?\s*$"#).unwrap());
    for line in &lines[body_start..body_end.min(lines.len())] {
        if line.trim().is_empty() {
            continue;
        }
        return DOCSTRING.captures(line).map(|c| c[1].trim().to_string());
    }
    None
}

fn cyclomatic_complexity(lines: &[&str]) -> u32 {
    static DECISION: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\b(if|elif|for|while|except|and|or|case)\b").unwrap()
    });
    let mut count = 1u32;
    for line in lines {
        count += DECISION.find_iter(line).count() as u32;
    }
    count
}

fn extract_calls(lines: &[&str]) -> Vec<String> {
    static CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([a-zA-Z_][\w.]*)\s*\(").unwrap());
    static KEYWORDS: &[&str] = &["if", "elif", "while", "for", "def", "class", "return", "with", "except", "print"];
    let mut calls = Vec::new();
    for line in lines {
        for cap in CALL.captures_iter(line) {
            let name = cap[1].to_string();
            let leaf = name.rsplit('.').next().unwrap_or(&name);
            if !KEYWORDS.contains(&leaf) && !calls.contains(&name) {
                calls.push(name);
            }
        }
    }
    calls
}

/// Parses Python source (the only language-specific piece of the
/// core) and extracts functions, classes, imports, and anti-patterns.
/// Syntax errors never raise: they yield a single `error` anti-pattern
/// and a summary describing the failure.
pub fn analyze(source: &str) -> CodeAnalysis {
    if let Err(e) = ast::Suite::parse(source, "<snippet>") {
        return CodeAnalysis {
            functions: Vec::new(),
            classes: Vec::new(),
            imports: Vec::new(),
            anti_patterns: vec![AntiPattern {
                kind: "error".to_string(),
                location: "<snippet>".to_string(),
                detail: format!("syntax error: {e}"),
            }],
            line_count: source.lines().count(),
            summary: format!("Failed to parse: {e}"),
        };
    }

    let lines: Vec<&str> = source.lines().collect();
    static DEF: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(\s*)(async\s+)?def\s+(\w+)\s*\(([^)]*)\)\s*(->\s*([^:]+))?:").unwrap()
    });
    static CLASS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s*)class\s+(\w+)\s*(\(([^)]*)\))?:").unwrap());
    static IMPORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*import\s+(.+)$").unwrap());
    static IMPORT_FROM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*from\s+(\S+)\s+import\s+(.+)$").unwrap());
    static DECORATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*@(\S+)").unwrap());
    static BARE_EXCEPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*except\s*:").unwrap());
    static MUTABLE_DEFAULT: Lazy<Regex> = Lazy::new(|| Regex::new(r"=\s*(\[\]|\{\})").unwrap());
    static GLOBAL_KW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*global\b").unwrap());
    static SELF_ASSIGN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*self\.(\w+)\s*=").unwrap());

    let mut functions = Vec::new();
    let mut classes = Vec::new();
    let mut imports = Vec::new();
    let mut anti_patterns = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if BARE_EXCEPT.is_match(line) {
            anti_patterns.push(AntiPattern { kind: "bare_except".to_string(), location: format!("line {}", i + 1), detail: "bare except clause".to_string() });
        }
        if MUTABLE_DEFAULT.is_match(line) && DEF.is_match(line) {
            anti_patterns.push(AntiPattern { kind: "mutable_default".to_string(), location: format!("line {}", i + 1), detail: "mutable default argument".to_string() });
        }
        if GLOBAL_KW.is_match(line) {
            anti_patterns.push(AntiPattern { kind: "global_usage".to_string(), location: format!("line {}", i + 1), detail: "use of global".to_string() });
        }

        if let Some(caps) = DEF.captures(line) {
            let is_async = caps.get(2).is_some();
            let name = caps[3].to_string();
            let args_raw = &caps[4];
            let args: Vec<String> = args_raw
                .split(',')
                .map(|a| a.trim().split(':').next().unwrap_or("").split('=').next().unwrap_or("").trim().to_string())
                .filter(|a| !a.is_empty() && a != "self" && a != "cls")
                .collect();
            let return_annotation = caps.get(6).map(|m| m.as_str().trim().to_string());

            let end = block_end(&lines, i);
            let body = &lines[i..end];
            let docstring = extract_docstring(&lines, i + 1, end);
            let complexity = cyclomatic_complexity(body);
            let calls = extract_calls(body);

            let mut decorators = Vec::new();
            let mut j = i;
            while j > 0 {
                j -= 1;
                if let Some(d) = DECORATOR.captures(lines[j]) {
                    decorators.insert(0, d[1].to_string());
                } else if lines[j].trim().is_empty() {
                    continue;
                } else {
                    break;
                }
            }

            let line_span = end - i;
            if line_span > LONG_FUNCTION_LINES {
                anti_patterns.push(AntiPattern { kind: "long_function".to_string(), location: format!("{name} (line {})", i + 1), detail: format!("{line_span} lines") });
            }
            if args.len() > MANY_ARGS {
                anti_patterns.push(AntiPattern { kind: "many_args".to_string(), location: format!("{name} (line {})", i + 1), detail: format!("{} args", args.len()) });
            }
            if complexity > HIGH_COMPLEXITY {
                anti_patterns.push(AntiPattern { kind: "high_complexity".to_string(), location: format!("{name} (line {})", i + 1), detail: format!("complexity {complexity}") });
            }

            functions.push(PyFunction {
                name,
                args,
                return_annotation,
                docstring,
                start_line: i + 1,
                end_line: end,
                cyclomatic_complexity: complexity,
                decorators,
                calls,
                is_async,
            });
            continue;
        }

        if let Some(caps) = CLASS.captures(line) {
            let name = caps[2].to_string();
            let bases: Vec<String> = caps
                .get(4)
                .map(|m| m.as_str().split(',').map(|b| b.trim().to_string()).filter(|b| !b.is_empty()).collect())
                .unwrap_or_default();
            let end = block_end(&lines, i);
            let body = &lines[i..end];

            let mut methods = Vec::new();
            let mut attributes = Vec::new();
            let mut in_init = false;
            let init_indent = indent_of(line) + 4;
            for bline in body.iter() {
                if let Some(mcaps) = DEF.captures(bline) {
                    let mname = mcaps[3].to_string();
                    in_init = mname == "__init__";
                    methods.push(mname);
                } else if in_init {
                    if let Some(scaps) = SELF_ASSIGN.captures(bline) {
                        if indent_of(bline) > init_indent && !attributes.contains(&scaps[1].to_string()) {
                            attributes.push(scaps[1].to_string());
                        }
                    }
                }
            }

            classes.push(PyClass { name, bases, methods, attributes, start_line: i + 1, end_line: end });
            continue;
        }

        if let Some(caps) = IMPORT_FROM.captures(line) {
            let names = caps[2].split(',').map(|n| n.trim().to_string()).collect();
            imports.push(ImportStmt { module: caps[1].to_string(), names, is_from: true });
        } else if let Some(caps) = IMPORT.captures(line) {
            let names: Vec<String> = caps[1].split(',').map(|n| n.trim().to_string()).collect();
            imports.push(ImportStmt { module: names.first().cloned().unwrap_or_default(), names, is_from: false });
        }
    }

    let summary = format!(
        "{} functions, {} classes, {} imports, {} anti-pattern(s)",
        functions.len(),
        classes.len(),
        imports.len(),
        anti_patterns.len()
    );

    CodeAnalysis { functions, classes, imports, anti_patterns, line_count: lines.len(), summary }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_function_args_and_decorators() {
        let src = "@staticmethod\ndef add(a, b):\n    return a + b\n";
        let analysis = analyze(src);
        assert_eq!(analysis.functions.len(), 1);
        assert_eq!(analysis.functions[0].args, vec!["a", "b"]);
        assert_eq!(analysis.functions[0].decorators, vec!["staticmethod"]);
    }

    #[test]
    fn detects_bare_except_and_mutable_default() {
        let src = "def f(x=[]):\n    try:\n        pass\n    except:\n        pass\n";
        let analysis = analyze(src);
        assert!(analysis.anti_patterns.iter().any(|a| a.kind == "bare_except"));
        assert!(analysis.anti_patterns.iter().any(|a| a.kind == "mutable_default"));
    }

    #[test]
    fn syntax_error_never_raises() {
        let src = "def f(:\n    pass\n";
        let analysis = analyze(src);
        assert_eq!(analysis.anti_patterns.len(), 1);
        assert_eq!(analysis.anti_patterns[0].kind, "error");
        assert!(!analysis.summary.is_empty());
    }

    #[test]
    fn extracts_class_attributes_from_init() {
        let src = "class Foo:\n    def __init__(self):\n        self.x = 1\n        self.y = 2\n    def bar(self):\n        pass\n";
        let analysis = analyze(src);
        assert_eq!(analysis.classes.len(), 1);
        assert_eq!(analysis.classes[0].attributes, vec!["x", "y"]);
        assert_eq!(analysis.classes[0].methods, vec!["__init__", "bar"]);
    }
}
