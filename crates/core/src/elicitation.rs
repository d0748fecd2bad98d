//! Form rendering and answer collection for elicitation requests.
//!
//! A requested schema is a flat JSON object schema whose properties are
//! primitives. Each answer is coerced to its declared type; blank optional
//! fields are left out of the answers, blank required fields and unparsable
//! values are asked again. A schema without `properties` is answered with raw
//! JSON.

use async_trait::async_trait;
use serde_json::{Map, Number, Value};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ElicitationError {
    #[error("requested schema is invalid: {0}")]
    InvalidSchema(String),

    #[error("field '{field}' has unsupported type '{kind}'")]
    UnsupportedType { field: String, kind: String },

    #[error("{0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Enum(Vec<String>),
}

impl FieldType {
    fn label(&self) -> String {
        match self {
            Self::String => "string".into(),
            Self::Number => "number".into(),
            Self::Integer => "integer".into(),
            Self::Boolean => "boolean".into(),
            Self::Enum(options) => format!("one of: {}", options.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub field_type: FieldType,
    pub required: bool,
}

impl FormField {
    pub fn prompt(&self) -> String {
        let mut prompt = format!("Enter {}", self.title.as_deref().unwrap_or(&self.name));
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            prompt.push_str(&format!(" ({})", description));
        }
        if let FieldType::Enum(_) = self.field_type {
            prompt.push_str(&format!(" [{}]", self.field_type.label()));
        }
        if !self.required {
            prompt.push_str(" [optional]");
        }
        prompt.push_str(": ");
        prompt
    }
}

/// Parsed elicitation request plus the answers gathered so far
#[derive(Debug, Clone, PartialEq)]
pub struct ElicitationForm {
    pub message: String,
    pub fields: Vec<FormField>,
    /// No `properties`: answer with a raw JSON object
    pub raw: bool,
    pub answers: Map<String, Value>,
}

impl ElicitationForm {
    pub fn parse(message: impl Into<String>, schema: &Value) -> Result<Self, ElicitationError> {
        let schema = schema
            .as_object()
            .ok_or_else(|| ElicitationError::InvalidSchema("schema must be an object".into()))?;

        let Some(properties) = schema.get("properties") else {
            return Ok(Self {
                message: message.into(),
                fields: Vec::new(),
                raw: true,
                answers: Map::new(),
            });
        };
        let properties = properties.as_object().ok_or_else(|| {
            ElicitationError::InvalidSchema("properties must be an object".into())
        })?;

        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut fields = Vec::with_capacity(properties.len());
        for (name, property) in properties {
            fields.push(FormField {
                name: name.clone(),
                title: string_field(property, "title"),
                description: string_field(property, "description"),
                field_type: field_type(name, property)?,
                required: required.contains(&name.as_str()),
            });
        }

        Ok(Self {
            message: message.into(),
            fields,
            raw: false,
            answers: Map::new(),
        })
    }

    /// Multi-line summary shown before collection starts.
    pub fn describe(&self) -> String {
        if self.raw {
            return format!("{}\nPlease provide data as JSON.", self.message);
        }
        let mut out = format!("{}\nFields:", self.message);
        for field in &self.fields {
            let need = if field.required { "required" } else { "optional" };
            out.push_str(&format!(
                "\n  - {} ({}, {})",
                field.name,
                field.field_type.label(),
                need
            ));
            if let Some(description) = &field.description {
                out.push_str(&format!(": {}", description));
            }
        }
        out
    }
}

fn string_field(property: &Value, key: &str) -> Option<String> {
    property.get(key).and_then(Value::as_str).map(str::to_string)
}

fn field_type(name: &str, property: &Value) -> Result<FieldType, ElicitationError> {
    if let Some(options) = property.get("enum").and_then(Value::as_array) {
        let options = options
            .iter()
            .map(|o| o.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                ElicitationError::InvalidSchema(format!("enum for '{}' must be strings", name))
            })?;
        return Ok(FieldType::Enum(options));
    }

    match property.get("type").and_then(Value::as_str).unwrap_or("string") {
        "string" => Ok(FieldType::String),
        "number" => Ok(FieldType::Number),
        "integer" => Ok(FieldType::Integer),
        "boolean" => Ok(FieldType::Boolean),
        other => Err(ElicitationError::UnsupportedType {
            field: name.to_string(),
            kind: other.to_string(),
        }),
    }
}

/// Coerce one non-blank answer to the field's declared type.
pub fn coerce(field_type: &FieldType, input: &str) -> Result<Value, ElicitationError> {
    let input = input.trim();
    match field_type {
        FieldType::String => Ok(Value::String(input.to_string())),
        FieldType::Integer => input
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| ElicitationError::InvalidValue(format!("'{}' is not an integer", input))),
        FieldType::Number => input
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| ElicitationError::InvalidValue(format!("'{}' is not a number", input))),
        FieldType::Boolean => match input.to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "n" | "0" => Ok(Value::Bool(false)),
            _ => Err(ElicitationError::InvalidValue(format!(
                "'{}' is not a boolean (yes/no)",
                input
            ))),
        },
        FieldType::Enum(options) => options
            .iter()
            .find(|o| o.as_str() == input)
            .map(|o| Value::String(o.clone()))
            .ok_or_else(|| {
                ElicitationError::InvalidValue(format!(
                    "'{}' is not one of: {}",
                    input,
                    options.join(", ")
                ))
            }),
    }
}

/// Source of answers, typically a terminal
#[async_trait]
pub trait FormPrompter: Send + Sync {
    /// Ask one question. `None` means the user gave up (end of input).
    async fn ask(&self, prompt: &str) -> Option<String>;

    /// Show a line of text.
    async fn show(&self, text: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElicitationOutcome {
    Accept(Map<String, Value>),
    Decline,
    Cancel,
}

impl ElicitationOutcome {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Accept(_) => "accept",
            Self::Decline => "decline",
            Self::Cancel => "cancel",
        }
    }
}

/// Fill the form field by field.
pub async fn collect(form: &mut ElicitationForm, prompter: &dyn FormPrompter) -> ElicitationOutcome {
    if form.raw {
        return collect_raw(form, prompter).await;
    }

    for field in form.fields.clone() {
        loop {
            let Some(answer) = prompter.ask(&field.prompt()).await else {
                return ElicitationOutcome::Cancel;
            };
            if answer.trim().is_empty() {
                if field.required {
                    prompter.show(&format!("Error: {} is required", field.name)).await;
                    continue;
                }
                break;
            }
            match coerce(&field.field_type, &answer) {
                Ok(value) => {
                    form.answers.insert(field.name.clone(), value);
                    break;
                }
                Err(e) => prompter.show(&format!("Error: {}. Please try again.", e)).await,
            }
        }
    }

    ElicitationOutcome::Accept(form.answers.clone())
}

async fn collect_raw(form: &mut ElicitationForm, prompter: &dyn FormPrompter) -> ElicitationOutcome {
    loop {
        let Some(answer) = prompter.ask("JSON data: ").await else {
            return ElicitationOutcome::Cancel;
        };
        match serde_json::from_str::<Value>(answer.trim()) {
            Ok(Value::Object(map)) => {
                form.answers = map;
                return ElicitationOutcome::Accept(form.answers.clone());
            }
            Ok(_) => prompter.show("Error: expected a JSON object. Please try again.").await,
            Err(e) => prompter.show(&format!("Error: invalid JSON ({}). Please try again.", e)).await,
        }
    }
}

/// Full interactive exchange: show the request, ask accept, decline or
/// cancel, then collect the form on accept.
pub async fn run_dialogue(
    message: &str,
    schema: &Value,
    prompter: &dyn FormPrompter,
) -> Result<ElicitationOutcome, ElicitationError> {
    let mut form = ElicitationForm::parse(message, schema)?;
    prompter.show(&form.describe()).await;

    loop {
        let Some(choice) = prompter.ask("Provide this information? [y]es / [n]o / [c]ancel: ").await
        else {
            return Ok(ElicitationOutcome::Cancel);
        };
        match choice.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(collect(&mut form, prompter).await),
            "n" | "no" => return Ok(ElicitationOutcome::Decline),
            "c" | "cancel" => return Ok(ElicitationOutcome::Cancel),
            _ => prompter.show("Please answer y, n or c.").await,
        }
    }
}
