use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// The typed domain value decoded from a watched ConfigMap or custom resource.
///
/// Entities are identified by name alone; the namespace is carried along but
/// takes no part in identity.
pub trait Entity: Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn name(&self) -> &str;

    fn set_name(&mut self, name: String);

    fn namespace(&self) -> Option<&str>;

    fn set_namespace(&mut self, namespace: String);

    fn same_entity(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

/// Compares the full serialized content of two entities, not only their identity
pub fn same_content<E: Serialize>(a: &E, b: &E) -> bool {
    match (serde_hashkey::to_key(a), serde_hashkey::to_key(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// The part of a watched object that carries the entity
#[derive(Debug, Clone, Copy)]
pub enum RawBody<'a> {
    /// The `config` key of a ConfigMap
    Yaml(Option<&'a str>),
    /// The `spec` of a custom resource
    Json(Option<&'a serde_json::Value>),
}

pub trait EntityCodec<E>: Send + Sync {
    /// Turns a raw body into an entity, back-filling name and namespace from
    /// the object metadata when the body does not carry them.
    ///
    /// `None` means the object can not be turned into an entity at all.
    fn decode(&self, body: RawBody<'_>, fallback_name: &str, fallback_namespace: Option<&str>) -> Option<E>;
}

/// Deserializes the body with serde; an unparsable body yields a default entity
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodec;

impl<E: Entity> EntityCodec<E> for DefaultCodec {
    fn decode(&self, body: RawBody<'_>, fallback_name: &str, fallback_namespace: Option<&str>) -> Option<E> {
        let parsed: crate::Result<Option<E>> = match body {
            RawBody::Yaml(Some(doc)) if !doc.trim().is_empty() => serde_yaml::from_str(doc).map_err(Into::into),
            RawBody::Json(Some(value)) if !value.is_null() => {
                serde_json::from_value(value.clone()).map(Some).map_err(Into::into)
            }
            _ => Ok(None),
        };

        let mut entity = match parsed {
            Ok(entity) => entity.unwrap_or_default(),
            Err(err) => {
                warn!("Unable to parse the definition of {fallback_name}, using defaults: {err}");
                E::default()
            }
        };

        if entity.name().is_empty() {
            entity.set_name(fallback_name.to_string());
        }
        if entity.namespace().is_none() {
            if let Some(ns) = fallback_namespace {
                entity.set_namespace(ns.to_string());
            }
        }

        if entity.name().is_empty() {
            None
        } else {
            Some(entity)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Widget {
        #[serde(skip_serializing_if = "String::is_empty")]
        pub name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub namespace: Option<String>,
        pub size: i32,
        pub color: Option<String>,
    }

    impl Entity for Widget {
        fn name(&self) -> &str {
            &self.name
        }

        fn set_name(&mut self, name: String) {
            self.name = name;
        }

        fn namespace(&self) -> Option<&str> {
            self.namespace.as_deref()
        }

        fn set_namespace(&mut self, namespace: String) {
            self.namespace = Some(namespace);
        }
    }

    impl Widget {
        pub fn new(name: &str, size: i32) -> Self {
            Widget {
                name: name.into(),
                size,
                ..Default::default()
            }
        }
    }

    fn decode(body: RawBody<'_>) -> Option<Widget> {
        DefaultCodec.decode(body, "from-meta", Some("ns1"))
    }

    #[test]
    fn yaml_body_is_parsed_and_backfilled() {
        let widget = decode(RawBody::Yaml(Some("size: 3\ncolor: red\n"))).unwrap();
        assert_eq!(widget.name, "from-meta");
        assert_eq!(widget.namespace.as_deref(), Some("ns1"));
        assert_eq!(widget.size, 3);
        assert_eq!(widget.color.as_deref(), Some("red"));
    }

    #[test]
    fn name_in_body_wins_over_metadata() {
        let widget = decode(RawBody::Json(Some(&json!({"name": "inner", "size": 2})))).unwrap();
        assert_eq!(widget.name, "inner");
        assert_eq!(widget.size, 2);
    }

    #[test]
    fn missing_or_empty_body_yields_default_with_name() {
        for body in [RawBody::Yaml(None), RawBody::Yaml(Some("  ")), RawBody::Json(None)] {
            let widget = decode(body).unwrap();
            assert_eq!(widget.name, "from-meta");
            assert_eq!(widget.size, 0);
        }
    }

    #[test]
    fn broken_body_yields_default_with_name() {
        let widget = decode(RawBody::Yaml(Some("size: [not, a, number"))).unwrap();
        assert_eq!(widget, Widget {
            name: "from-meta".into(),
            namespace: Some("ns1".into()),
            ..Default::default()
        });
    }

    #[test]
    fn decoding_is_deterministic() {
        let body = json!({"size": 5, "color": "blue"});
        let a = decode(RawBody::Json(Some(&body))).unwrap();
        let b = decode(RawBody::Json(Some(&body))).unwrap();
        assert!(same_content(&a, &b));
    }

    #[test]
    fn nameless_object_is_rejected() {
        let widget: Option<Widget> = DefaultCodec.decode(RawBody::Yaml(Some("size: 1")), "", None);
        assert!(widget.is_none());
    }

    #[test]
    fn identity_is_name_only() {
        let a = Widget::new("a", 1);
        let mut b = Widget::new("a", 2);
        b.namespace = Some("elsewhere".into());
        assert!(a.same_entity(&b));
        assert!(!same_content(&a, &b));
        assert!(!a.same_entity(&Widget::new("c", 1)));
    }
}
