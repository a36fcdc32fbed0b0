//! `{{placeholder}}` substitution.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use herald_common::types::{RenderedMessage, Template, Variables};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{(\w+)\}\}").unwrap());

/// Replace every `{{name}}` in `text` with the matching variable.
///
/// Names must sit directly inside the braces; `{{ name }}` is not a placeholder.
/// Unknown placeholders are left verbatim. String values are inserted as-is,
/// anything else as its JSON text.
pub fn render(text: &str, variables: &Variables) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| match variables.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn render_template(template: &Template, variables: &Variables) -> RenderedMessage {
    RenderedMessage {
        subject: render(&template.subject, variables),
        body: render(&template.body, variables),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_substitutes_known_placeholders() {
        let v = vars(json!({"name": "Ana"}));
        assert_eq!(render("Hi {{name}}", &v), "Hi Ana");
        assert_eq!(render("{{name}} and {{name}}", &v), "Ana and Ana");
    }

    #[test]
    fn test_missing_placeholder_left_verbatim() {
        let v = vars(json!({"name": "Ana"}));
        assert_eq!(render("Hi {{missing}}", &v), "Hi {{missing}}");
        assert_eq!(render("{{ missing }}", &v), "{{ missing }}");
        assert_eq!(render("no placeholders", &v), "no placeholders");
    }

    #[test]
    fn test_padded_braces_are_not_placeholders() {
        let v = vars(json!({"name": "Ana"}));
        assert_eq!(render("Hi {{ name }}!", &v), "Hi {{ name }}!");
        assert_eq!(render("{{name }} {{ name}}", &v), "{{name }} {{ name}}");
    }

    #[test]
    fn test_non_string_values() {
        let v = vars(json!({"count": 3, "vip": true, "gone": null}));
        assert_eq!(
            render("{{count}} items, vip={{vip}}, {{gone}}", &v),
            "3 items, vip=true, null"
        );
    }

    #[test]
    fn test_rendering_is_pure() {
        let v = vars(json!({"name": "{{name}}"}));
        // Substituted text is not rendered again.
        let once = render("Hi {{name}}", &v);
        assert_eq!(once, "Hi {{name}}");
        assert_eq!(render("Hi {{name}}", &v), once);
    }

    #[test]
    fn test_render_template() {
        let template = Template {
            subject: "Welcome, {{name}}".into(),
            body: "<p>Your code is {{code}}</p>".into(),
        };
        let rendered = render_template(&template, &vars(json!({"name": "Ana"})));
        assert_eq!(rendered.subject, "Welcome, Ana");
        assert_eq!(rendered.body, "<p>Your code is {{code}}</p>");
    }
}
