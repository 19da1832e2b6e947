//! 环境变量覆盖模块
//!
//! 将配置树中的每个叶子路径映射为环境变量名 `PREFIX_PATH`
//! （`.` 替换为 `_` 并转为大写），若变量已设置则覆盖对应的值。
//! 环境变量拥有最高优先级，在主配置源合并之后应用。

use serde_json::{Number, Value};
use tracing::debug;

/// 环境变量覆盖层
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOverlay {
    /// 环境变量前缀，空字符串表示不加前缀
    prefix: String,
}

impl EnvOverlay {
    /// 创建新的覆盖层
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// 环境变量前缀
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 根据字段路径生成环境变量名
    ///
    /// `server.port` + 前缀 `APP` => `APP_SERVER_PORT`
    pub fn var_name(&self, path: &str) -> String {
        let key = path.replace('.', "_").to_uppercase();
        if self.prefix.is_empty() {
            key
        } else {
            format!("{}_{}", self.prefix.to_uppercase(), key)
        }
    }

    /// 使用进程环境变量覆盖配置树，返回被应用的覆盖记录
    pub fn apply(&self, doc: &mut Value) -> Vec<AppliedOverride> {
        self.apply_with(doc, |name| std::env::var(name).ok())
    }

    /// 使用自定义查找函数覆盖配置树
    pub fn apply_with<F>(&self, doc: &mut Value, lookup: F) -> Vec<AppliedOverride>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();
        self.overlay(doc, String::new(), String::new(), &lookup, &mut applied);
        applied
    }

    fn overlay<F>(
        &self,
        value: &mut Value,
        path: String,
        pointer: String,
        lookup: &F,
        applied: &mut Vec<AppliedOverride>,
    ) where
        F: Fn(&str) -> Option<String>,
    {
        if let Value::Object(map) = value {
            for (key, child) in map.iter_mut() {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                let token = key.replace('~', "~0").replace('/', "~1");
                let child_pointer = format!("{pointer}/{token}");
                self.overlay(child, child_path, child_pointer, lookup, applied);
            }
            return;
        }

        if path.is_empty() {
            return;
        }

        let name = self.var_name(&path);
        match lookup(&name) {
            Some(raw) if !raw.is_empty() => {
                debug!(var = %name, path = %path, "应用环境变量覆盖");
                let untyped = value.is_null();
                let coerced = coerce(&raw, value);
                *value = coerced;
                applied.push(AppliedOverride {
                    var: name,
                    pointer,
                    raw,
                    untyped,
                });
            }
            _ => {}
        }
    }
}

/// 一条已应用的环境变量覆盖
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOverride {
    /// 环境变量名
    pub var: String,
    /// 被覆盖字段的 JSON Pointer
    pub pointer: String,
    /// 环境变量原始值
    pub raw: String,
    /// 原值为 null，无法根据原值推断类型
    pub untyped: bool,
}

/// 将字符串转换为配置值
///
/// 原值为字符串时保持字符串；原值为数组或对象时先尝试按 JSON 解析；
/// 其余情况依次尝试 布尔 -> 整数 -> 浮点数，都失败则保留字符串
pub fn coerce(raw: &str, current: &Value) -> Value {
    match current {
        Value::String(_) => return Value::String(raw.to_string()),
        Value::Array(_) | Value::Object(_) => {
            if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                if std::mem::discriminant(&parsed) == std::mem::discriminant(current) {
                    return parsed;
                }
            }
        }
        _ => {}
    }

    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }

    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(uint) = raw.parse::<u64>() {
        return Value::Number(uint.into());
    }
    if let Some(float) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(float);
    }

    Value::String(raw.to_string())
}
