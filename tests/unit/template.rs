use bulk_dispatch::error::BindingError;
use bulk_dispatch::template::{
    bind, BoundComponent, Button, ButtonKind, Component, ComponentKind, HeaderFormat, MediaRef,
    Template, TemplateParameters, TemplateStatus,
};
use std::collections::BTreeMap;

fn body_template(text: &str) -> Template {
    Template {
        name: "promo".to_string(),
        language: "fr".to_string(),
        status: TemplateStatus::Approved,
        components: vec![Component::Body {
            text: text.to_string(),
        }],
    }
}

fn body_with_placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("v{{{{{}}}}}", i))
        .collect::<Vec<_>>()
        .join(" ")
}

fn values(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("p{}", i)).collect()
}

#[test]
fn test_exact_count_binds_and_off_by_one_fails() {
    for n in 1..6 {
        let template = body_template(&body_with_placeholders(n));

        let exact = TemplateParameters {
            body: values(n),
            ..TemplateParameters::default()
        };
        assert!(bind(&template, &exact).is_ok(), "n = {n}");

        for got in [n - 1, n + 1] {
            let params = TemplateParameters {
                body: values(got),
                ..TemplateParameters::default()
            };
            let err = bind(&template, &params).unwrap_err();
            assert_eq!(err.kind(), "parameter_count_mismatch");
            assert_eq!(
                err,
                BindingError::ParameterCountMismatch {
                    component: ComponentKind::Body,
                    button_index: None,
                    expected: n,
                    got,
                }
            );
        }
    }
}

#[test]
fn test_body_is_rendered() {
    let template = body_template("Bonjour {{1}}, votre code est {{2}}");
    let bound = bind(&template, &TemplateParameters::body(&["Awa", "1234"])).unwrap();
    assert_eq!(
        bound.components,
        vec![BoundComponent::Body {
            text: "Bonjour Awa, votre code est 1234".to_string(),
            parameters: vec!["Awa".to_string(), "1234".to_string()],
        }]
    );
    assert!(bound.warnings.is_empty());
}

#[test]
fn test_non_contiguous_placeholders_rejected() {
    let template = body_template("{{2}} then {{1}}");
    let err = bind(&template, &TemplateParameters::body(&["a", "b"])).unwrap_err();
    assert_eq!(err.kind(), "invalid_placeholders");
    assert!(template.validate().is_err());
}

#[test]
fn test_media_header_requires_reference() {
    let template = Template {
        name: "receipt".to_string(),
        language: "en".to_string(),
        status: TemplateStatus::Approved,
        components: vec![
            Component::Header {
                format: HeaderFormat::Document,
                text: None,
            },
            Component::Body {
                text: "Your receipt".to_string(),
            },
        ],
    };
    assert_eq!(
        bind(&template, &TemplateParameters::default()),
        Err(BindingError::MissingHeaderMedia)
    );

    let params = TemplateParameters {
        header_media: Some(MediaRef::Id("media-42".to_string())),
        ..TemplateParameters::default()
    };
    let bound = bind(&template, &params).unwrap();
    match &bound.components[0] {
        BoundComponent::Header { media, format, .. } => {
            assert_eq!(*format, HeaderFormat::Document);
            assert_eq!(media, &Some(MediaRef::Id("media-42".to_string())));
        }
        other => panic!("unexpected component {other:?}"),
    }
}

#[test]
fn test_button_placeholders_scoped_per_button() {
    let template = Template {
        name: "track".to_string(),
        language: "en".to_string(),
        status: TemplateStatus::Approved,
        components: vec![
            Component::Body {
                text: "Order {{1}} shipped".to_string(),
            },
            Component::Buttons {
                buttons: vec![
                    Button {
                        kind: ButtonKind::QuickReply,
                        text: "Thanks".to_string(),
                        url: None,
                        phone_number: None,
                    },
                    Button {
                        kind: ButtonKind::Url,
                        text: "Track".to_string(),
                        url: Some("https://t.example/{{1}}".to_string()),
                        phone_number: None,
                    },
                ],
            },
        ],
    };

    let mut buttons = BTreeMap::new();
    buttons.insert(1, vec!["ABC123".to_string()]);
    let params = TemplateParameters {
        body: vec!["#77".to_string()],
        buttons,
        ..TemplateParameters::default()
    };
    let bound = bind(&template, &params).unwrap();
    assert_eq!(bound.components.len(), 3);
    match &bound.components[2] {
        BoundComponent::Button { index, url, .. } => {
            assert_eq!(*index, 1);
            assert_eq!(url.as_deref(), Some("https://t.example/ABC123"));
        }
        other => panic!("unexpected component {other:?}"),
    }

    let missing = TemplateParameters {
        body: vec!["#77".to_string()],
        ..TemplateParameters::default()
    };
    assert_eq!(
        bind(&template, &missing),
        Err(BindingError::ParameterCountMismatch {
            component: ComponentKind::Buttons,
            button_index: Some(1),
            expected: 1,
            got: 0,
        })
    );
}

#[test]
fn test_empty_values_and_extra_sections_warn() {
    let template = body_template("Hi {{1}}");
    let mut buttons = BTreeMap::new();
    buttons.insert(3, vec!["x".to_string()]);
    let params = TemplateParameters {
        header: vec!["unused".to_string()],
        body: vec!["  ".to_string()],
        buttons,
        ..TemplateParameters::default()
    };
    let bound = bind(&template, &params).unwrap();
    let components: Vec<ComponentKind> = bound.warnings.iter().map(|w| w.component).collect();
    assert_eq!(
        components,
        vec![ComponentKind::Body, ComponentKind::Header, ComponentKind::Buttons]
    );
    assert_eq!(bound.warnings[2].button_index, Some(3));
}

#[test]
fn test_component_order_preserved() {
    let template = Template {
        name: "welcome".to_string(),
        language: "fr".to_string(),
        status: TemplateStatus::Approved,
        components: vec![
            Component::Header {
                format: HeaderFormat::Text,
                text: Some("Salut {{1}}".to_string()),
            },
            Component::Body {
                text: "Bienvenue".to_string(),
            },
            Component::Footer {
                text: "STOP au 123".to_string(),
            },
        ],
    };
    let params = TemplateParameters {
        header: vec!["Awa".to_string()],
        ..TemplateParameters::default()
    };
    let bound = bind(&template, &params).unwrap();
    assert!(matches!(
        &bound.components[0],
        BoundComponent::Header { text: Some(text), .. } if text == "Salut Awa"
    ));
    assert!(matches!(bound.components[1], BoundComponent::Body { .. }));
    assert!(matches!(bound.components[2], BoundComponent::Footer { .. }));
}

#[test]
fn test_template_deserializes_from_catalog_json() {
    let raw = r#"{
        "name": "order_update",
        "language": "en",
        "status": "PENDING",
        "components": [
            {"type": "HEADER", "format": "IMAGE"},
            {"type": "BODY", "text": "Hello {{1}}"},
            {"type": "BUTTONS", "buttons": [
                {"type": "URL", "text": "Open", "url": "https://x.example/{{1}}"}
            ]}
        ]
    }"#;
    let template: Template = serde_json::from_str(raw).unwrap();
    assert_eq!(template.status, TemplateStatus::Pending);
    assert_eq!(template.components[1].placeholder_count().unwrap(), 1);
    assert_eq!(template.components[2].placeholder_count().unwrap(), 1);
    assert_eq!(template.components[0].placeholder_count().unwrap(), 0);
}
