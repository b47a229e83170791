//! 会话历史读取：`sessions:list` 与 `sessions:messages`。
//!
//! 每条会话是目录下的一个 JSON 文档，文档内自带真实项目路径，
//! 不从目录名反解。

use std::{fs, path::Path};

use anyhow::{Context, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};

/// 会话文档结构（宽松解析，缺字段按默认处理）。
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDoc {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    /// 真实项目路径，随文档持久化。
    #[serde(default)]
    path: String,
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    messages: Vec<Value>,
}

/// 列出全部会话的摘要，按更新时间倒序。
pub(crate) fn list(dir: &Path) -> anyhow::Result<Value> {
    let mut sessions = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // 目录还不存在等价于空列表。
        Err(_) => return Ok(json!({ "sessions": [] })),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(doc) = serde_json::from_str::<SessionDoc>(&raw) else {
            continue;
        };
        sessions.push(json!({
            "id": doc.id,
            "title": doc.title,
            "path": doc.path,
            "updatedAt": doc.updated_at,
            "messageCount": doc.messages.len(),
        }));
    }

    sessions.sort_by(|a, b| {
        let a_key = a["updatedAt"].as_str().unwrap_or_default();
        let b_key = b["updatedAt"].as_str().unwrap_or_default();
        b_key.cmp(a_key)
    });
    Ok(json!({ "sessions": sessions }))
}

/// 读取单条会话的完整消息列表。
pub(crate) fn messages(dir: &Path, session_id: &str) -> anyhow::Result<Value> {
    let id = session_id.trim();
    // 会话 ID 只允许安全字符，杜绝路径穿越。
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(anyhow!("invalid session id"));
    }

    let path = dir.join(format!("{id}.json"));
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("session {id} not found"))?;
    let doc: SessionDoc = serde_json::from_str(&raw)
        .with_context(|| format!("session {id} is not valid json"))?;
    Ok(json!({
        "id": doc.id,
        "title": doc.title,
        "path": doc.path,
        "updatedAt": doc.updated_at,
        "messages": doc.messages,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_dir_with_sessions() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cs-sessions-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("s1.json"),
            r#"{"id":"s1","title":"older","path":"/work/a","updatedAt":"2026-07-01T00:00:00Z","messages":[{"role":"user","text":"hi"}]}"#,
        )
        .unwrap();
        fs::write(
            dir.join("s2.json"),
            r#"{"id":"s2","title":"newer","path":"/work/b","updatedAt":"2026-08-01T00:00:00Z","messages":[]}"#,
        )
        .unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();
        dir
    }

    #[test]
    fn list_sorts_by_updated_at_desc() {
        let dir = temp_dir_with_sessions();
        let value = list(&dir).unwrap();
        let sessions = value["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0]["id"], "s2");
        assert_eq!(sessions[1]["messageCount"], 1);
        assert_eq!(sessions[1]["path"], "/work/a");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_dir_yields_empty_list() {
        let value = list(Path::new("/definitely/not/here")).unwrap();
        assert!(value["sessions"].as_array().unwrap().is_empty());
    }

    #[test]
    fn messages_rejects_traversal_ids() {
        let dir = temp_dir_with_sessions();
        assert!(messages(&dir, "../etc/passwd").is_err());
        assert!(messages(&dir, "").is_err());
        assert!(messages(&dir, "missing").is_err());
        let value = messages(&dir, "s1").unwrap();
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
