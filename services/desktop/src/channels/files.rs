//! 文件名检索：`files:search`，深度与条数双重封顶。

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde_json::{Value, json};

/// 结果条数上限。
const MAX_RESULTS: usize = 200;
/// 递归深度上限。
const MAX_DEPTH: usize = 12;

/// 按文件名子串（大小写不敏感）检索工作目录。
pub(crate) fn search(root: &Path, query: &str, limit: usize) -> Value {
    let query = query.trim().to_lowercase();
    let limit = limit.clamp(1, MAX_RESULTS);
    let mut results = Vec::new();
    if !query.is_empty() {
        walk(root, root, &query, limit, 0, &mut results);
    }
    json!({
        "results": results.iter().map(|p| p.to_string_lossy()).collect::<Vec<_>>(),
        "truncated": results.len() >= limit,
    })
}

fn walk(
    root: &Path,
    dir: &Path,
    query: &str,
    limit: usize,
    depth: usize,
    results: &mut Vec<PathBuf>,
) {
    if depth > MAX_DEPTH || results.len() >= limit {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    let mut entries = entries.flatten().collect::<Vec<_>>();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if results.len() >= limit {
            return;
        }
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else {
            continue;
        };
        // 隐藏目录与构建产物不进结果。
        if name_str.starts_with('.') || name_str == "target" || name_str == "node_modules" {
            continue;
        }

        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, query, limit, depth + 1, results);
        } else if name_str.to_lowercase().contains(query) {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            results.push(relative);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_tree() -> PathBuf {
        let root = std::env::temp_dir().join(format!("cs-files-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(root.join("src/deep")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("target")).unwrap();
        fs::write(root.join("src/main.rs"), "").unwrap();
        fs::write(root.join("src/deep/Config.toml"), "").unwrap();
        fs::write(root.join(".git/config"), "").unwrap();
        fs::write(root.join("target/config.json"), "").unwrap();
        root
    }

    #[test]
    fn search_is_case_insensitive_and_skips_hidden() {
        let root = temp_tree();
        let value = search(&root, "config", 50);
        let results = value["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].as_str().unwrap().ends_with("Config.toml"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let root = temp_tree();
        let value = search(&root, "  ", 50);
        assert!(value["results"].as_array().unwrap().is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn limit_is_enforced() {
        let root = temp_tree();
        for i in 0..10 {
            fs::write(root.join(format!("match-{i}.txt")), "").unwrap();
        }
        let value = search(&root, "match", 3);
        assert_eq!(value["results"].as_array().unwrap().len(), 3);
        assert_eq!(value["truncated"], true);
        let _ = fs::remove_dir_all(&root);
    }
}
