use serde_json::Value;
use std::collections::HashMap;

/// 把参数值转换成模板中的文本
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 渲染 `{{Name}}` 或 `{{ .Name }}` 形式的占位符，找不到的参数保持原样
pub fn render_template(text: &str, params: &HashMap<String, Value>) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim().trim_start_matches('.').trim();
                match params.get(key) {
                    Some(value) => out.push_str(&value_to_string(value)),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_template() {
        let mut params = HashMap::new();
        params.insert("JobID".to_string(), json!(42));
        params.insert("Branch".to_string(), json!("main"));
        assert_eq!(
            render_template("build {{JobID}} on {{ .Branch }}", &params),
            "build 42 on main"
        );
        assert_eq!(render_template("keep {{Missing}}", &params), "keep {{Missing}}");
        assert_eq!(render_template("open {{ brace", &params), "open {{ brace");
        assert_eq!(render_template("plain", &params), "plain");
    }
}
