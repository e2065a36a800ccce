use chrono::format::{Item, StrftimeItems};
use minijinja::{context, Environment, Error, ErrorKind};
use regex::Regex;

use crate::backend::ChatFormatter;
use crate::{ChatRole, Message, SessionConfig};

/// Preprocess a Jinja2 template string for minijinja compatibility.
///
/// Fixes Python-specific syntax that minijinja doesn't support:
/// - `tojson(ensure_ascii=False)` → `tojson`
/// - `.endswith("x")` → ` is endingwith("x")`
/// - `.startswith("x")` → ` is startingwith("x")`
/// - `.strip()` → ` | trim`
/// - `.items()` → ` | items`
fn preprocess_template(template: &str) -> String {
    let mut result = template
        .replace("tojson(ensure_ascii=False)", "tojson")
        .replace("tojson(ensure_ascii=True)", "tojson");

    if let Ok(re) = Regex::new(r"\.endswith\(") {
        result = re.replace_all(&result, " is endingwith(").to_string();
    }
    if let Ok(re) = Regex::new(r"\.startswith\(") {
        result = re.replace_all(&result, " is startingwith(").to_string();
    }

    result.replace(".strip()", " | trim").replace(".items()", " | items")
}

/// `strftime_now(fmt)`, used by Mistral and Llama 3 templates for the current date.
fn strftime_now(fmt: String) -> Result<String, Error> {
    let items: Vec<Item<'_>> = StrftimeItems::new(&fmt).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid strftime format {fmt:?}"),
        ));
    }
    Ok(chrono::Local::now().format_with_items(items.into_iter()).to_string())
}

/// Render a Jinja2 chat template (model metadata or inline override).
pub fn render_jinja(
    template_source: &str,
    messages: &[Message],
    add_generation_prompt: bool,
    bos_token: &str,
    eos_token: &str,
) -> Result<String, String> {
    let processed = preprocess_template(template_source);

    let mut env = Environment::new();
    // raise_exception(msg): templates use it to reject unsupported role orders
    env.add_function("raise_exception", |msg: String| -> Result<String, Error> {
        Err(Error::new(ErrorKind::InvalidOperation, msg))
    });
    env.add_function("strftime_now", strftime_now);

    env.add_template("chat_template", &processed)
        .map_err(|e| format!("Failed to parse chat template: {e}"))?;
    let template = env
        .get_template("chat_template")
        .map_err(|e| format!("Failed to get template: {e}"))?;

    template
        .render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
            bos_token => bos_token,
            eos_token => eos_token,
        })
        .map_err(|e| format!("Failed to render template: {e}"))
}

/// Minimal role-tagged concatenation used when no template applier exists.
///
/// ```text
/// USER:
/// Describe this.
///
/// ASSISTANT:
/// ```
pub fn render_role_tagged(messages: &[Message], add_generation_prompt: bool) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&message.role.as_str().to_uppercase());
        out.push_str(":\n");
        out.push_str(&message.content);
        out.push_str("\n\n");
    }
    if add_generation_prompt {
        out.push_str("ASSISTANT:\n");
    }
    out
}

/// Active chat template selection for one loaded session.
#[derive(Debug, Clone)]
pub struct ChatTemplates {
    template_override: Option<String>,
    use_jinja: bool,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplates {
    pub fn new<F: ChatFormatter>(formatter: &F, config: &SessionConfig) -> Self {
        Self {
            template_override: config.chat_template.clone(),
            use_jinja: config.use_jinja,
            bos_token: formatter.bos_token(),
            eos_token: formatter.eos_token(),
        }
    }

    pub fn template_override(&self) -> Option<&str> {
        self.template_override.as_deref()
    }

    pub fn uses_jinja(&self) -> bool {
        self.use_jinja
    }

    /// Render `messages` into prompt text.
    pub fn apply<F: ChatFormatter>(
        &self,
        formatter: &F,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<String, String> {
        let template_override = self.template_override();
        if self.use_jinja {
            let source = formatter
                .template_source(template_override)
                .ok_or_else(|| "no jinja chat template available".to_string())?;
            return render_jinja(&source, messages, add_generation_prompt, &self.bos_token, &self.eos_token);
        }

        match formatter.apply_builtin_template(template_override, messages, add_generation_prompt)? {
            Some(rendered) => Ok(rendered),
            None => Ok(render_role_tagged(messages, add_generation_prompt)),
        }
    }

    /// Example conversation rendered with the active template, for the load log.
    pub fn format_example<F: ChatFormatter>(&self, formatter: &F) -> Result<String, String> {
        let messages = [
            Message::new(ChatRole::System, "You are a helpful assistant"),
            Message::new(ChatRole::User, "Hello"),
            Message::new(ChatRole::Assistant, "Hi there"),
            Message::new(ChatRole::User, "How are you?"),
        ];
        self.apply(formatter, &messages, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockLoader, MOCK_TEMPLATE};
    use crate::backend::RuntimeLoader;

    #[test]
    fn test_preprocess_template_strips_ensure_ascii() {
        let output = preprocess_template(r"{{ tool | tojson(ensure_ascii=False) }}");
        assert_eq!(output, "{{ tool | tojson }}");
    }

    #[test]
    fn test_preprocess_template_converts_python_methods() {
        assert_eq!(
            preprocess_template(r#"message.content.startswith('<tool_response>')"#),
            r#"message.content is startingwith('<tool_response>')"#
        );
        assert_eq!(
            preprocess_template(r#"m.content.endswith("/nothink")"#),
            r#"m.content is endingwith("/nothink")"#
        );
        assert_eq!(preprocess_template("{{ content.strip() }}"), "{{ content | trim }}");
    }

    #[test]
    fn test_jinja_render() {
        let messages = vec![Message::system("You are helpful."), Message::user("Hello!")];
        let prompt = render_jinja(MOCK_TEMPLATE, &messages, true, "<s>", "</s>").unwrap();
        assert_eq!(
            prompt,
            "<|system|>\nYou are helpful.</s>\n<|user|>\nHello!</s>\n<|assistant|>\n"
        );
    }

    #[test]
    fn test_raise_exception_surfaces_message() {
        let template = r#"{% if true %}{{ raise_exception("roles must alternate") }}{% endif %}"#;
        let err = render_jinja(template, &[], false, "", "").unwrap_err();
        assert!(err.contains("roles must alternate"));
    }

    #[test]
    fn test_strftime_now() {
        let date = render_jinja(r#"{{ strftime_now("%Y-%m-%d") }}"#, &[], false, "", "").unwrap();
        assert_eq!(date.len(), 10);
        assert_eq!(&date[4..5], "-");
        assert_eq!(&date[7..8], "-");
    }

    #[test]
    fn test_role_tagged_fallback() {
        let rendered = render_role_tagged(&[Message::user("hi")], true);
        assert_eq!(rendered, "USER:\nhi\n\nASSISTANT:\n");
        assert_eq!(render_role_tagged(&[], false), "");
    }

    #[test]
    fn test_apply_picks_jinja_or_fallback() {
        let mut config = SessionConfig::new("m.gguf").with_mmproj("p.gguf");
        let runtime = MockLoader::new().load(&config).unwrap();
        let messages = [Message::user("hi")];

        let fallback = ChatTemplates::new(&runtime, &config);
        assert_eq!(fallback.apply(&runtime, &messages, true).unwrap(), "USER:\nhi\n\nASSISTANT:\n");

        config.use_jinja = true;
        let jinja = ChatTemplates::new(&runtime, &config);
        assert_eq!(
            jinja.apply(&runtime, &messages, true).unwrap(),
            "<|user|>\nhi</s>\n<|assistant|>\n"
        );
        assert!(jinja.format_example(&runtime).unwrap().contains("How are you?"));
    }
}
