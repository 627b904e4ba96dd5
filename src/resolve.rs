use std::collections::HashSet;

use url::Url;

use crate::{Params, RequestHead};

const SYNTHETIC_BASE: &str = "http://localhost";

/// Call target.
#[derive(Clone, Debug)]
pub enum Input {
    /// Absolute or relative URL string.
    Str(String),
    Url(Url),
    /// Pre-built request; its URL is used verbatim.
    Request(RequestHead),
}

impl Input {
    /// String form of the target before base and query resolution.
    pub fn href(&self) -> &str {
        match self {
            Self::Str(text) => text,
            Self::Url(url) => url.as_str(),
            Self::Request(head) => &head.url,
        }
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for Input {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<Url> for Input {
    fn from(value: Url) -> Self {
        Self::Url(value)
    }
}

impl From<RequestHead> for Input {
    fn from(value: RequestHead) -> Self {
        Self::Request(value)
    }
}

/// Builds the final request target.
///
/// Default-level params whose key already appears in the input's own query
/// are dropped; call-level params win over the remaining defaults. The
/// serialized query is appended after everything else in `input`, including
/// a `#fragment`.
pub fn resolve_url(
    base: Option<&str>,
    input: &str,
    default_params: Option<&Params>,
    call_params: Option<&Params>,
    serialize_params: &dyn Fn(&Params) -> String,
) -> String {
    let base = base.unwrap_or("");
    let target = if is_absolute(input) || base.is_empty() {
        input.to_owned()
    } else {
        join(base, input)
    };

    let present = query_keys(input);
    let mut merged = Params::new();
    for (key, value) in default_params.into_iter().flatten() {
        if !present.contains(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in call_params.into_iter().flatten() {
        merged.insert(key.clone(), value.clone());
    }

    let serialized = serialize_params(&merged);
    let query = serialized.strip_prefix('?').unwrap_or(&serialized);
    if query.is_empty() {
        return target;
    }

    let separator = if target.contains('?') { '&' } else { '?' };
    format!("{target}{separator}{query}")
}

fn is_absolute(input: &str) -> bool {
    let prefix = |scheme: &str| {
        input
            .get(..scheme.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
    };
    prefix("http://") || prefix("https://")
}

fn join(base: &str, input: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = input.trim_start_matches('/');
    match (base.is_empty(), path.is_empty()) {
        (_, true) => base.to_owned(),
        (true, false) => path.to_owned(),
        (false, false) => format!("{base}/{path}"),
    }
}

fn query_keys(input: &str) -> HashSet<String> {
    let parsed = Url::parse(input).or_else(|_| {
        Url::parse(SYNTHETIC_BASE).and_then(|synthetic| synthetic.join(input))
    });
    match parsed {
        Ok(url) => url.query_pairs().map(|(key, _)| key.into_owned()).collect(),
        Err(_) => HashSet::new(),
    }
}
