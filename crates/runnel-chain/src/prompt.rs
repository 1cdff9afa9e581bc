use async_trait::async_trait;
use serde_json::{Map, Value};

use runnel_core::callbacks::RunType;
use runnel_core::config::RunnableConfig;
use runnel_core::error::{ChainError, Result, RunnelError};
use runnel_core::runnable::Runnable;
use runnel_core::traced::call_with_config;

/// A template that formats a string by substituting `{variable}`
/// placeholders from a JSON object.
///
/// `{{` and `}}` produce literal braces. String values are inserted as-is;
/// other JSON values are inserted in their compact JSON form.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn from_template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Placeholder names in order of first appearance.
    pub fn input_variables(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for segment in parse(&self.template)? {
            if let Segment::Variable(name) = segment {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    pub fn format(&self, variables: &Map<String, Value>) -> Result<String> {
        let mut result = String::with_capacity(self.template.len());
        for segment in parse(&self.template)? {
            match segment {
                Segment::Text(text) => result.push_str(&text),
                Segment::Variable(name) => match variables.get(&name) {
                    Some(Value::String(s)) => result.push_str(s),
                    Some(other) => result.push_str(&other.to_string()),
                    None => return Err(ChainError::MissingVariable(name).into()),
                },
            }
        }
        Ok(result)
    }
}

enum Segment {
    Text(String),
    Variable(String),
}

fn parse(template: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let mut var_name = String::new();
                let mut found_close = false;
                for next_ch in chars.by_ref() {
                    if next_ch == '}' {
                        found_close = true;
                        break;
                    }
                    var_name.push(next_ch);
                }
                if !found_close {
                    return Err(template_error("unclosed '{' in template"));
                }
                let var_name = var_name.trim();
                if var_name.is_empty() {
                    return Err(template_error("empty placeholder '{}' in template"));
                }
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Variable(var_name.to_string()));
            }
            '}' => return Err(template_error("single '}' in template")),
            _ => text.push(ch),
        }
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

fn template_error(message: &str) -> RunnelError {
    ChainError::Template(message.into()).into()
}

#[async_trait]
impl Runnable for PromptTemplate {
    type Input = Value;
    type Output = String;

    fn name(&self) -> String {
        "PromptTemplate".into()
    }

    fn run_type(&self) -> RunType {
        RunType::Prompt
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(self.name(), RunType::Prompt, input, config, |input, _child| async move {
            match &input {
                Value::Object(variables) => self.format(variables),
                other => Err(ChainError::Template(format!(
                    "prompt input must be a JSON object, got {other}"
                ))
                .into()),
            }
        })
        .await
    }
}
