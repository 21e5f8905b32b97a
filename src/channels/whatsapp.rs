use serde_json::{json, Value};

use crate::error::ApiError;
use crate::template::{BoundComponent, BoundTemplate, ButtonKind, HeaderFormat, MediaRef};
use crate::types::MessagePayload;

fn text_parameters(values: &[String]) -> Vec<Value> {
    values
        .iter()
        .map(|value| json!({ "type": "text", "text": value }))
        .collect()
}

fn media_parameter(format: HeaderFormat, media: &MediaRef) -> Value {
    let kind = match format {
        HeaderFormat::Video => "video",
        HeaderFormat::Document => "document",
        HeaderFormat::Image | HeaderFormat::Text | HeaderFormat::Location => "image",
    };
    let reference = match media {
        MediaRef::Link(link) => json!({ "link": link }),
        MediaRef::Id(id) => json!({ "id": id }),
    };
    json!({ "type": kind, kind: reference })
}

fn component_json(component: &BoundComponent) -> Option<Value> {
    match component {
        BoundComponent::Header {
            format,
            media: Some(media),
            ..
        } => Some(json!({
            "type": "header",
            "parameters": [media_parameter(*format, media)],
        })),
        BoundComponent::Header { parameters, .. } if !parameters.is_empty() => Some(json!({
            "type": "header",
            "parameters": text_parameters(parameters),
        })),
        BoundComponent::Body { parameters, .. } if !parameters.is_empty() => Some(json!({
            "type": "body",
            "parameters": text_parameters(parameters),
        })),
        BoundComponent::Button {
            index,
            kind: ButtonKind::Url,
            parameters,
            ..
        } if !parameters.is_empty() => Some(json!({
            "type": "button",
            "sub_type": "url",
            "index": index.to_string(),
            "parameters": text_parameters(parameters),
        })),
        // static components are part of the approved template already
        _ => None,
    }
}

fn template_json(bound: &BoundTemplate) -> Value {
    let components: Vec<Value> = bound.components.iter().filter_map(component_json).collect();
    let mut template = json!({
        "name": bound.name,
        "language": { "code": bound.language },
    });
    if !components.is_empty() {
        template["components"] = Value::Array(components);
    }
    template
}

pub fn build_cloud_api_payload(recipient_e164: &str, payload: &MessagePayload) -> Value {
    let to = recipient_e164.trim_start_matches('+');
    match payload {
        MessagePayload::Template(bound) => json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "template",
            "template": template_json(bound),
        }),
        MessagePayload::Text { body } => json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": body },
        }),
    }
}

pub fn parse_send_response(body: &Value) -> Option<String> {
    body.get("messages")?
        .get(0)?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

pub fn parse_error_response(http_status: u16, body: &Value) -> ApiError {
    let error = body.get("error");
    let code = error.and_then(|e| e.get("code")).and_then(|code| match code {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    });
    let message = error
        .and_then(|e| {
            e.get("error_data")
                .and_then(|d| d.get("details"))
                .or_else(|| e.get("message"))
        })
        .and_then(Value::as_str)
        .unwrap_or("whatsapp api error")
        .to_string();
    ApiError::new(Some(http_status), code.as_deref(), message)
}
