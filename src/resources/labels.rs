use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

pub const KIND_LABEL: &str = "kind";
pub const RC_TYPE_LABEL: &str = "rcType";
pub const POD_TYPE_LABEL: &str = "podType";
pub const SERVICE_TYPE_LABEL: &str = "serviceType";
pub const DEPLOYMENT_LABEL: &str = "deployment";

/// `<prefix>kind`, e.g. `radanalytics.io/kind`
pub fn kind_label(prefix: &str) -> String {
    format!("{prefix}{KIND_LABEL}")
}

/// Labels a ConfigMap has to carry to be picked up by the operator for `kind`
pub fn for_kind(kind: &str, prefix: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(kind_label(prefix), kind.to_string())])
}

pub fn get_kind<'a>(labels: &'a BTreeMap<String, String>, prefix: &str) -> Option<&'a str> {
    labels.get(&kind_label(prefix)).map(String::as_str)
}

pub fn is_a_kind(labels: &BTreeMap<String, String>, kind: &str, prefix: &str) -> bool {
    get_kind(labels, prefix) == Some(kind)
}

pub fn label_selector(labels: BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels),
        match_expressions: None,
    }
}

pub fn label_selector_string(ls: &LabelSelector) -> String {
    let mut selectors: Vec<String> = Vec::new();

    if let Some(labels) = &ls.match_labels {
        // environment=production
        selectors.extend(labels.iter().map(|(k, v)| format!("{k}={v}")));
    }

    if let Some(expressions) = &ls.match_expressions {
        selectors.extend(expressions.iter().filter_map(|e| {
            let values = e.values.as_deref().unwrap_or_default().join(",");
            match e.operator.as_str() {
                "In" => Some(format!("{} in ({values})", e.key)), // environment in (production, qa)
                "NotIn" => Some(format!("{} notin ({values})", e.key)), // tier notin (frontend, backend)
                "Exists" => Some(e.key.clone()),                  // partition
                "DoesNotExist" => Some(format!("!{}", e.key)),    // !partition
                _ => None,                                        // invalid operator, skip it
            }
        }));
    }

    selectors.join(",")
}
