//! 配置差异计算模块
//!
//! 在自描述的配置树（`serde_json::Value`）上递归比较新旧两份配置，
//! 生成以路径寻址的变更项列表。字段路径使用序列化后的名称，
//! 因此 `#[serde(rename)]` 决定路径名，`#[serde(skip)]` 的字段不会出现在差异中。
//!
//! 路径规则：
//! - 结构体字段与映射键使用 `.` 连接，如 `app.server.port`
//! - 数组元素使用下标，如 `services[2].url`
//! - 顶层路径为空时直接使用字段名

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// 单个配置变更项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeItem {
    /// 配置路径，如 "app.server.port"
    pub path: String,
    /// 旧值，`None` 表示新增
    pub old_value: Option<Value>,
    /// 新值，`None` 表示删除
    pub new_value: Option<Value>,
}

impl ChangeItem {
    fn new(path: &str, old_value: Option<Value>, new_value: Option<Value>) -> Self {
        Self {
            path: path.to_string(),
            old_value,
            new_value,
        }
    }

    /// 是否为新增项
    pub fn is_addition(&self) -> bool {
        self.old_value.is_none() && self.new_value.is_some()
    }

    /// 是否为删除项
    pub fn is_removal(&self) -> bool {
        self.old_value.is_some() && self.new_value.is_none()
    }

    /// 将旧值解析为指定类型
    pub fn old_as<U: DeserializeOwned>(&self) -> Option<U> {
        self.old_value
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// 将新值解析为指定类型
    pub fn new_as<U: DeserializeOwned>(&self) -> Option<U> {
        self.new_value
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

impl fmt::Display for ChangeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show(value: &Option<Value>) -> String {
            match value {
                Some(value) => value.to_string(),
                None => "<none>".to_string(),
            }
        }
        write!(
            f,
            "{}: {} -> {}",
            self.path,
            show(&self.old_value),
            show(&self.new_value)
        )
    }
}

/// 比较两个类型化的配置快照
pub fn diff<T: Serialize>(old: &T, new: &T) -> Result<Vec<ChangeItem>> {
    let old = serde_json::to_value(old)?;
    let new = serde_json::to_value(new)?;
    Ok(diff_values(&old, &new, ""))
}

/// 比较两棵配置树，`base_path` 为前缀路径
pub fn diff_values(old: &Value, new: &Value, base_path: &str) -> Vec<ChangeItem> {
    let mut changes = Vec::new();
    collect(Some(old), Some(new), base_path, &mut changes);
    changes
}

/// 缺失的键与 null 一样视为"不存在"
fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn same_kind(old: &Value, new: &Value) -> bool {
    std::mem::discriminant(old) == std::mem::discriminant(new)
}

fn join_key(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}.{key}")
    }
}

fn collect(old: Option<&Value>, new: Option<&Value>, path: &str, out: &mut Vec<ChangeItem>) {
    let (old, new) = match (present(old), present(new)) {
        (None, None) => return,
        (None, Some(new)) => {
            out.push(ChangeItem::new(path, None, Some(new.clone())));
            return;
        }
        (Some(old), None) => {
            out.push(ChangeItem::new(path, Some(old.clone()), None));
            return;
        }
        (Some(old), Some(new)) => (old, new),
    };

    // 类型不同时不再递归，整体视为替换
    if !same_kind(old, new) {
        out.push(ChangeItem::new(path, Some(old.clone()), Some(new.clone())));
        return;
    }

    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            // 先按旧配置的键顺序，再补充新配置独有的键
            let mut seen = HashSet::new();
            let keys = old_map
                .keys()
                .chain(new_map.keys())
                .filter(|key| seen.insert(key.as_str()));

            for key in keys {
                collect(old_map.get(key), new_map.get(key), &join_key(path, key), out);
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            // 长度不同不做位置对齐，整体记录一次
            if old_items.len() != new_items.len() {
                out.push(ChangeItem::new(path, Some(old.clone()), Some(new.clone())));
                return;
            }

            let before = out.len();
            for (index, (old_item, new_item)) in old_items.iter().zip(new_items).enumerate() {
                collect(Some(old_item), Some(new_item), &format!("{path}[{index}]"), out);
            }

            if out.len() == before {
                out.push(ChangeItem::new(path, Some(old.clone()), Some(new.clone())));
            }
        }
        _ => out.push(ChangeItem::new(path, Some(old.clone()), Some(new.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct AppConfig {
        app: App,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        #[serde(default)]
        hosts: Vec<String>,
        #[serde(skip)]
        internal_counter: u32,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct App {
        name: String,
        port: u16,
        #[serde(rename = "debug_mode")]
        debug: bool,
    }

    fn sample() -> AppConfig {
        AppConfig {
            app: App {
                name: "x".to_string(),
                port: 8080,
                debug: false,
            },
            labels: BTreeMap::from([("env".to_string(), "dev".to_string())]),
            hosts: vec!["a".to_string(), "b".to_string()],
            internal_counter: 0,
        }
    }

    #[test]
    fn test_equal_values_produce_no_changes() {
        let config = sample();
        assert!(diff(&config, &config.clone()).unwrap().is_empty());
    }

    #[test]
    fn test_single_scalar_change() {
        let old = sample();
        let mut new = sample();
        new.app.port = 9000;

        let changes = diff(&old, &new).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "app.port");
        assert_eq!(changes[0].old_as::<u16>(), Some(8080));
        assert_eq!(changes[0].new_as::<u16>(), Some(9000));
    }

    #[test]
    fn test_renamed_field_uses_serialized_name() {
        let old = sample();
        let mut new = sample();
        new.app.debug = true;

        let changes = diff(&old, &new).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "app.debug_mode");
    }

    #[test]
    fn test_skipped_field_is_ignored() {
        let old = sample();
        let mut new = sample();
        new.internal_counter = 42;
        assert!(diff(&old, &new).unwrap().is_empty());
    }

    #[test]
    fn test_map_key_added_and_removed() {
        let old = sample();
        let mut new = sample();
        new.labels.insert("team".to_string(), "core".to_string());

        let changes = diff(&old, &new).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "labels.team");
        assert!(changes[0].is_addition());
        assert_eq!(changes[0].new_value, Some(json!("core")));

        let changes = diff(&new, &old).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_removal());
        assert_eq!(changes[0].old_value, Some(json!("core")));
        assert_eq!(changes[0].new_value, None);
    }

    #[test]
    fn test_length_change_reports_whole_array() {
        let old = sample();
        let mut new = sample();
        new.hosts.push("c".to_string());

        let changes = diff(&old, &new).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "hosts");
        assert_eq!(changes[0].old_value, Some(json!(["a", "b"])));
        assert_eq!(changes[0].new_value, Some(json!(["a", "b", "c"])));
    }

    #[test]
    fn test_same_length_array_reports_elements() {
        let old = json!({"hosts": ["a", "b", "c"]});
        let new = json!({"hosts": ["a", "x", "c"]});

        let changes = diff_values(&old, &new, "");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "hosts[1]");
        assert_eq!(changes[0].old_value, Some(json!("b")));
        assert_eq!(changes[0].new_value, Some(json!("x")));
    }

    #[test]
    fn test_nested_array_of_objects() {
        let old = json!({"services": [{"name": "a", "port": 1}, {"name": "b", "port": 2}]});
        let new = json!({"services": [{"name": "a", "port": 1}, {"name": "b", "port": 3}]});

        let changes = diff_values(&old, &new, "");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "services[1].port");
    }

    #[test]
    fn test_type_mismatch_short_circuits() {
        let old = json!({"limits": {"cpu": 1}});
        let new = json!({"limits": "unlimited"});

        let changes = diff_values(&old, &new, "");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "limits");
        assert_eq!(changes[0].old_value, Some(json!({"cpu": 1})));
        assert_eq!(changes[0].new_value, Some(json!("unlimited")));
    }

    #[test]
    fn test_null_disparity_is_addition_or_removal() {
        let old = json!({"tls": null});
        let new = json!({"tls": {"cert": "a.pem"}});

        let changes = diff_values(&old, &new, "");
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_addition());

        let changes = diff_values(&new, &old, "");
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_removal());
    }

    #[test]
    fn test_base_path_prefix() {
        let changes = diff_values(&json!({"port": 1}), &json!({"port": 2}), "server");
        assert_eq!(changes[0].path, "server.port");

        let changes = diff_values(&json!(1), &json!(2), "");
        assert_eq!(changes[0].path, "");
    }

    #[test]
    fn test_field_order_follows_declaration() {
        let old = json!({"b": 1, "a": 1, "c": 1});
        let new = json!({"b": 2, "a": 2, "d": 2});

        let paths: Vec<_> = diff_values(&old, &new, "")
            .into_iter()
            .map(|item| item.path)
            .collect();
        assert_eq!(paths, vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn test_rerun_after_apply_is_empty() {
        let old = sample();
        let mut new = sample();
        new.app.name = "y".to_string();
        new.hosts.clear();

        assert!(!diff(&old, &new).unwrap().is_empty());
        assert!(diff(&new, &new).unwrap().is_empty());
    }

    #[test]
    fn test_display() {
        let item = ChangeItem::new("app.port", Some(json!(8080)), Some(json!(9000)));
        assert_eq!(item.to_string(), "app.port: 8080 -> 9000");

        let item = ChangeItem::new("tags", None, Some(json!(["a"])));
        assert_eq!(item.to_string(), r#"tags: <none> -> ["a"]"#);
    }
}
