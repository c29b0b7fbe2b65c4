//! Prompt templating
//!
//! Handlebars-shaped `{{path.to.value}}` substitution over a JSON
//! context. Lookups that miss render as an empty string; unterminated
//! braces pass through untouched.

use tracing::debug;

/// Render a template against a JSON context
///
/// Paths are dot-separated (`input.text`, `state.count`). String values
/// substitute verbatim; other JSON values substitute as compact JSON.
pub fn render(template: &str, ctx: &serde_json::Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                out.push_str(&lookup(ctx, path));
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated braces: emit as-is
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolve a dot-path into the context, rendering the value as text
fn lookup(ctx: &serde_json::Value, path: &str) -> String {
    let mut current = ctx;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => {
                debug!(%path, "render: path missing from context");
                return String::new();
            }
        }
    }
    match current {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_substitution() {
        let ctx = serde_json::json!({"input": {"text": "hello"}});
        assert_eq!(render("Say {{input.text}}!", &ctx), "Say hello!");
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let ctx = serde_json::json!({"state": {"count": 3, "flags": [1, 2]}});
        assert_eq!(render("n={{state.count}} f={{state.flags}}", &ctx), "n=3 f=[1,2]");
    }

    #[test]
    fn test_missing_path_renders_empty() {
        let ctx = serde_json::json!({});
        assert_eq!(render("[{{nope.deep}}]", &ctx), "[]");
    }

    #[test]
    fn test_whitespace_inside_braces() {
        let ctx = serde_json::json!({"x": "y"});
        assert_eq!(render("{{ x }}", &ctx), "y");
    }

    #[test]
    fn test_unterminated_braces_pass_through() {
        let ctx = serde_json::json!({"x": "y"});
        assert_eq!(render("a {{x", &ctx), "a {{x");
    }

    #[test]
    fn test_multiple_substitutions() {
        let ctx = serde_json::json!({"a": "1", "b": "2"});
        assert_eq!(render("{{a}}{{b}}{{a}}", &ctx), "121");
    }
}
