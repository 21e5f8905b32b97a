use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::error::BindingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentKind {
    Header,
    Body,
    Footer,
    Buttons,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentKind::Header => "header",
            ComponentKind::Body => "body",
            ComponentKind::Footer => "footer",
            ComponentKind::Buttons => "buttons",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaderFormat {
    Text,
    Image,
    Video,
    Document,
    Location,
}

impl HeaderFormat {
    pub fn requires_media(&self) -> bool {
        matches!(
            self,
            HeaderFormat::Image | HeaderFormat::Video | HeaderFormat::Document
        )
    }
}

fn default_header_format() -> HeaderFormat {
    HeaderFormat::Text
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ButtonKind {
    QuickReply,
    Url,
    PhoneNumber,
    CopyCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    #[serde(rename = "type")]
    pub kind: ButtonKind,
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl Button {
    fn placeholder_source(&self) -> Option<&str> {
        match self.kind {
            ButtonKind::Url => self.url.as_deref(),
            ButtonKind::QuickReply | ButtonKind::PhoneNumber | ButtonKind::CopyCode => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Component {
    Header {
        #[serde(default = "default_header_format")]
        format: HeaderFormat,
        #[serde(default)]
        text: Option<String>,
    },
    Body {
        text: String,
    },
    Footer {
        text: String,
    },
    Buttons {
        buttons: Vec<Button>,
    },
}

impl Component {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Header { .. } => ComponentKind::Header,
            Component::Body { .. } => ComponentKind::Body,
            Component::Footer { .. } => ComponentKind::Footer,
            Component::Buttons { .. } => ComponentKind::Buttons,
        }
    }

    pub fn placeholder_count(&self) -> Result<usize, BindingError> {
        match self {
            Component::Header { format, text } => {
                if format.requires_media() || *format == HeaderFormat::Location {
                    return Ok(0);
                }
                count_placeholders(ComponentKind::Header, text.as_deref().unwrap_or(""))
            }
            Component::Body { text } => count_placeholders(ComponentKind::Body, text),
            Component::Footer { .. } => Ok(0),
            Component::Buttons { buttons } => {
                let mut total = 0;
                for button in buttons {
                    total += count_placeholders(
                        ComponentKind::Buttons,
                        button.placeholder_source().unwrap_or(""),
                    )?;
                }
                Ok(total)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateStatus {
    #[default]
    Approved,
    Pending,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub status: TemplateStatus,
    pub components: Vec<Component>,
}

impl Template {
    pub fn validate(&self) -> Result<(), BindingError> {
        for component in &self.components {
            component.placeholder_count()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaRef {
    Link(String),
    Id(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParameters {
    #[serde(default)]
    pub header: Vec<String>,
    #[serde(default)]
    pub header_media: Option<MediaRef>,
    #[serde(default)]
    pub body: Vec<String>,
    #[serde(default)]
    pub buttons: BTreeMap<usize, Vec<String>>,
}

impl TemplateParameters {
    pub fn body(values: &[&str]) -> Self {
        Self {
            body: values.iter().map(|v| v.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn map_values(&self, mut f: impl FnMut(&str) -> String) -> Self {
        Self {
            header: self.header.iter().map(|v| f(v)).collect(),
            header_media: self.header_media.clone(),
            body: self.body.iter().map(|v| f(v)).collect(),
            buttons: self
                .buttons
                .iter()
                .map(|(index, values)| (*index, values.iter().map(|v| f(v)).collect()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoundComponent {
    Header {
        format: HeaderFormat,
        text: Option<String>,
        parameters: Vec<String>,
        media: Option<MediaRef>,
    },
    Body {
        text: String,
        parameters: Vec<String>,
    },
    Footer {
        text: String,
    },
    Button {
        index: usize,
        kind: ButtonKind,
        text: String,
        url: Option<String>,
        parameters: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingWarning {
    pub component: ComponentKind,
    pub button_index: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundTemplate {
    pub name: String,
    pub language: String,
    pub components: Vec<BoundComponent>,
    #[serde(default)]
    pub warnings: Vec<BindingWarning>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\d+)\s*\}\}").expect("placeholder regex is valid"))
}

// placeholders must read {{1}}, {{2}}, ... in order
pub fn count_placeholders(component: ComponentKind, text: &str) -> Result<usize, BindingError> {
    let found: Vec<usize> = placeholder_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect();
    let contiguous = found.iter().enumerate().all(|(i, n)| *n == i + 1);
    if !contiguous {
        return Err(BindingError::InvalidPlaceholders { component, found });
    }
    Ok(found.len())
}

fn render(text: &str, parameters: &[String]) -> String {
    placeholder_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            caps.get(1)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .and_then(|n| parameters.get(n.saturating_sub(1)))
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

fn check_count(
    component: ComponentKind,
    button_index: Option<usize>,
    expected: usize,
    supplied: &[String],
) -> Result<(), BindingError> {
    if supplied.len() != expected {
        return Err(BindingError::ParameterCountMismatch {
            component,
            button_index,
            expected,
            got: supplied.len(),
        });
    }
    Ok(())
}

fn inspect_values(
    component: ComponentKind,
    button_index: Option<usize>,
    values: &[String],
    warnings: &mut Vec<BindingWarning>,
) {
    for (i, value) in values.iter().enumerate() {
        let problem = if value.trim().is_empty() {
            Some("is empty")
        } else if component != ComponentKind::Buttons && value.contains(|c| c == '\n' || c == '\t') {
            Some("contains a newline or tab")
        } else {
            None
        };
        if let Some(problem) = problem {
            warnings.push(BindingWarning {
                component,
                button_index,
                message: format!("parameter {{{{{}}}}} {}", i + 1, problem),
            });
        }
    }
}

fn warn(warnings: &mut Vec<BindingWarning>, component: ComponentKind, button_index: Option<usize>, message: String) {
    warnings.push(BindingWarning {
        component,
        button_index,
        message,
    });
}

// Count mismatches and a missing header media reference are errors;
// empty values and parameters with no matching slot become warnings.
pub fn bind(template: &Template, parameters: &TemplateParameters) -> Result<BoundTemplate, BindingError> {
    let mut components = Vec::with_capacity(template.components.len());
    let mut warnings = Vec::new();
    let mut has_header = false;
    let mut has_body = false;
    let mut button_count = 0;

    for component in &template.components {
        match component {
            Component::Header { format, text } => {
                has_header = true;
                if format.requires_media() {
                    let media = parameters
                        .header_media
                        .clone()
                        .ok_or(BindingError::MissingHeaderMedia)?;
                    if !parameters.header.is_empty() {
                        warn(
                            &mut warnings,
                            ComponentKind::Header,
                            None,
                            format!("{} text parameters ignored for media header", parameters.header.len()),
                        );
                    }
                    components.push(BoundComponent::Header {
                        format: *format,
                        text: None,
                        parameters: Vec::new(),
                        media: Some(media),
                    });
                    continue;
                }

                let source = text.as_deref().unwrap_or("");
                let expected = component.placeholder_count()?;
                check_count(ComponentKind::Header, None, expected, &parameters.header)?;
                inspect_values(ComponentKind::Header, None, &parameters.header, &mut warnings);
                if parameters.header_media.is_some() {
                    warn(
                        &mut warnings,
                        ComponentKind::Header,
                        None,
                        "media reference ignored for non-media header".to_string(),
                    );
                }
                components.push(BoundComponent::Header {
                    format: *format,
                    text: text.as_ref().map(|_| render(source, &parameters.header)),
                    parameters: parameters.header.clone(),
                    media: None,
                });
            }
            Component::Body { text } => {
                has_body = true;
                let expected = component.placeholder_count()?;
                check_count(ComponentKind::Body, None, expected, &parameters.body)?;
                inspect_values(ComponentKind::Body, None, &parameters.body, &mut warnings);
                components.push(BoundComponent::Body {
                    text: render(text, &parameters.body),
                    parameters: parameters.body.clone(),
                });
            }
            Component::Footer { text } => {
                components.push(BoundComponent::Footer { text: text.clone() });
            }
            Component::Buttons { buttons } => {
                button_count = buttons.len();
                for (index, button) in buttons.iter().enumerate() {
                    let source = button.placeholder_source().unwrap_or("");
                    let expected = count_placeholders(ComponentKind::Buttons, source)?;
                    let supplied = parameters
                        .buttons
                        .get(&index)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    check_count(ComponentKind::Buttons, Some(index), expected, supplied)?;
                    inspect_values(ComponentKind::Buttons, Some(index), supplied, &mut warnings);
                    components.push(BoundComponent::Button {
                        index,
                        kind: button.kind,
                        text: button.text.clone(),
                        url: button.url.as_deref().map(|url| render(url, supplied)),
                        parameters: supplied.to_vec(),
                    });
                }
            }
        }
    }

    if !has_header && (!parameters.header.is_empty() || parameters.header_media.is_some()) {
        warn(
            &mut warnings,
            ComponentKind::Header,
            None,
            "header parameters supplied but template has no header".to_string(),
        );
    }
    if !has_body && !parameters.body.is_empty() {
        warn(
            &mut warnings,
            ComponentKind::Body,
            None,
            "body parameters supplied but template has no body".to_string(),
        );
    }
    for index in parameters.buttons.keys().filter(|i| **i >= button_count) {
        warn(
            &mut warnings,
            ComponentKind::Buttons,
            Some(*index),
            format!("parameters supplied for missing button {}", index),
        );
    }

    Ok(BoundTemplate {
        name: template.name.clone(),
        language: template.language.clone(),
        components,
        warnings,
    })
}
