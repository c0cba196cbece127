use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

pub const SAME_NAMESPACE: &str = "~";
pub const ALL_NAMESPACES: &str = "*";

/// Settings shared by every operator started by the bootstrap.
#[derive(Debug, Clone, clap::Args)]
pub struct OperatorConfig {
    /// Comma separated namespaces to watch. Empty or `*` watches all namespaces, `~` the namespace the operator runs in.
    #[arg(
        long = "watch-namespace",
        env = "WATCH_NAMESPACE",
        value_name = "NAMESPACES",
        default_value = ""
    )]
    pub watch_namespace: String,

    /// Overrides the CRD flag of every operator declaration; anything but `false` enables CRD mode.
    #[arg(long = "crd", env = "CRD", action = clap::ArgAction::Set, value_parser = parse_flag)]
    pub crd: Option<bool>,

    /// Seconds between two full reconciliations of the same operator.
    #[arg(
        long = "full-reconciliation-interval",
        env = "FULL_RECONCILIATION_INTERVAL_S",
        value_name = "SECONDS",
        default_value_t = 180
    )]
    pub full_reconciliation_interval_s: u64,

    /// Upper bound for a single add, delete or modify operation.
    #[arg(
        long = "operation-timeout",
        env = "OPERATOR_OPERATION_TIMEOUT_MS",
        value_name = "MILLISECONDS",
        default_value_t = 60_000
    )]
    pub operation_timeout_ms: u64,

    #[arg(
        long = "metrics",
        env = "METRICS",
        action = clap::ArgAction::Set,
        value_parser = parse_flag,
        default_value = "true"
    )]
    pub metrics: bool,

    #[arg(long = "metrics-port", env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Pause between two failed attempts to re-open a watch.
    #[arg(
        long = "watch-retry-delay",
        env = "WATCH_RETRY_DELAY_MS",
        value_name = "MILLISECONDS",
        default_value_t = 1_000
    )]
    pub watch_retry_delay_ms: u64,

    /// Number of watch events handled concurrently across all operators.
    #[arg(long = "event-workers", env = "EVENT_WORKERS", default_value_t = 10)]
    pub event_workers: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: String::new(),
            crd: None,
            full_reconciliation_interval_s: 180,
            operation_timeout_ms: 60_000,
            metrics: true,
            metrics_port: 8080,
            watch_retry_delay_ms: 1_000,
            event_workers: 10,
        }
    }
}

impl OperatorConfig {
    pub fn namespace_scope(&self) -> NamespaceScope {
        NamespaceScope::parse(&self.watch_namespace)
    }

    pub fn full_reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.full_reconciliation_interval_s)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watch_retry_delay_ms)
    }
}

fn parse_flag(raw: &str) -> Result<bool, String> {
    Ok(!raw.trim().eq_ignore_ascii_case("false"))
}

/// Which namespaces the operators are started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    /// The namespace of the kube client, usually the one the operator pod runs in
    Current,
    /// One engine per operator watching every namespace
    All,
    /// One engine per operator and listed namespace; `~` entries stand for the current namespace
    Namespaces(Vec<String>),
}

impl NamespaceScope {
    pub fn parse(raw: &str) -> Self {
        static SEPARATOR: OnceLock<Regex> = OnceLock::new();
        let separator = SEPARATOR.get_or_init(|| Regex::new(r"\s*,+\s*").unwrap());

        let raw = raw.trim();
        if raw.is_empty() {
            return NamespaceScope::All;
        }

        let mut namespaces: Vec<String> = Vec::new();
        for ns in separator.split(raw) {
            let ns = ns
                .strip_prefix('"')
                .and_then(|ns| ns.strip_suffix('"'))
                .unwrap_or(ns)
                .trim();
            if ns.is_empty() || namespaces.iter().any(|existing| existing == ns) {
                continue;
            }
            namespaces.push(ns.to_string());
        }

        if namespaces
            .iter()
            .any(|ns| ns == ALL_NAMESPACES || ns.eq_ignore_ascii_case("all"))
        {
            return NamespaceScope::All;
        }

        match namespaces.as_slice() {
            [] => NamespaceScope::All,
            [ns] if is_same_namespace(ns) => NamespaceScope::Current,
            _ => NamespaceScope::Namespaces(namespaces),
        }
    }

    /// Expands the scope into the watch scopes engines are created for
    pub fn resolve(&self, current_namespace: &str) -> Vec<WatchScope> {
        match self {
            NamespaceScope::All => vec![WatchScope::All],
            NamespaceScope::Current => vec![WatchScope::Namespace(current_namespace.to_string())],
            NamespaceScope::Namespaces(namespaces) => {
                let mut scopes: Vec<WatchScope> = Vec::with_capacity(namespaces.len());
                for ns in namespaces {
                    let ns = if is_same_namespace(ns) {
                        current_namespace
                    } else {
                        ns.as_str()
                    };
                    let scope = WatchScope::Namespace(ns.to_string());
                    if !scopes.contains(&scope) {
                        scopes.push(scope);
                    }
                }
                scopes
            }
        }
    }
}

fn is_same_namespace(ns: &str) -> bool {
    ns == SAME_NAMESPACE || ns.eq_ignore_ascii_case("current")
}

/// The breadth of a single watch and engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchScope {
    Namespace(String),
    All,
}

impl WatchScope {
    pub fn namespace(&self) -> Option<&str> {
        match self {
            WatchScope::Namespace(ns) => Some(ns),
            WatchScope::All => None,
        }
    }

    /// Value used for the `namespace` metric label
    pub fn label(&self) -> &str {
        self.namespace().unwrap_or(ALL_NAMESPACES)
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchScope::Namespace(ns) => write!(f, "{ns}"),
            WatchScope::All => write!(f, "'all'"),
        }
    }
}
