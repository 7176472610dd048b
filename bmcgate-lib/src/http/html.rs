use serde_json::Value;

/// Render a JSON document as a self-contained HTML page with nested
/// tables, for browser clients whose Accept header prefers HTML.
pub fn dump_html(value: &Value) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(
        "<html>\n<head>\n<title>Redfish Service</title>\n\
         <style>table{border-collapse:collapse}td,th{border:1px solid #999;padding:4px 8px;\
         text-align:left;vertical-align:top}</style>\n</head>\n<body>\n",
    );
    dump_value(value, &mut out);
    out.push_str("</body>\n</html>\n");
    out
}

fn dump_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push_str("<table>\n");
            for (key, child) in map {
                out.push_str("<tr><th>");
                out.push_str(&escape(key));
                out.push_str("</th><td>");
                dump_value(child, out);
                out.push_str("</td></tr>\n");
            }
            out.push_str("</table>\n");
        }
        Value::Array(items) => {
            out.push_str("<table>\n");
            for item in items {
                out.push_str("<tr><td>");
                dump_value(item, out);
                out.push_str("</td></tr>\n");
            }
            out.push_str("</table>\n");
        }
        Value::String(s) => out.push_str(&escape(s)),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_nested_tables() {
        let html = dump_html(&json!({"a": {"b": [1, 2]}, "c": "text"}));
        assert!(html.starts_with("<html>"));
        assert!(html.contains("<th>a</th>"));
        assert!(html.contains("<th>b</th>"));
        assert!(html.contains("text"));
    }

    #[test]
    fn escapes_markup() {
        let html = dump_html(&json!({"k": "<script>alert('x')</script>"}));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
