//! Helpers for working with provider-approved message templates.
//!
//! Templates carry positional `{{n}}` placeholders per component. This crate
//! extracts them, substitutes caller parameters (leaving unresolved
//! placeholders literal), builds short body previews, and shapes the full
//! ordered parameter list into the wire form providers expect.
//!
//! Parameter naming convention: body placeholders resolve from `param_<n>`,
//! header placeholders from `header_param_<n>` with `header_<n>` accepted as
//! a fallback.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use unicode_segmentation::UnicodeSegmentation;

use odm_core::MessageTemplate;

/// Maximum grapheme length of a body preview.
pub const PREVIEW_LENGTH: usize = 60;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(\d+)\}\}").expect("placeholder regex"));

/// Extracts the set of positional placeholder numbers in a text fragment.
///
/// ```
/// let found = odm_templates::placeholders("Hola {{1}}, pedido {{2}} listo");
/// assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![1, 2]);
/// ```
pub fn placeholders(text: &str) -> BTreeSet<u32> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .filter_map(|captures| captures[1].parse::<u32>().ok())
        .collect()
}

/// Placeholder numbers per component, header and body kept distinct.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlaceholderSets {
    pub header: BTreeSet<u32>,
    pub body: BTreeSet<u32>,
}

impl PlaceholderSets {
    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.body.is_empty()
    }
}

pub fn template_placeholders(template: &MessageTemplate) -> PlaceholderSets {
    let mut sets = PlaceholderSets::default();
    if let Some(text) = template.header_text() {
        sets.header = placeholders(text);
    }
    if let Some(text) = template.body_text() {
        sets.body = placeholders(text);
    }
    sets
}

/// True iff the template declares any placeholder. Gates UI prompting only;
/// the dispatch coordinator re-validates completeness independently.
pub fn requires_parameters(template: &MessageTemplate) -> bool {
    !template_placeholders(template).is_empty()
}

/// Substitutes placeholders through `resolve`; unresolved placeholders stay
/// literal.
///
/// ```
/// let out = odm_templates::substitute("Hola {{1}} ({{2}})", |n| {
///     (n == 1).then(|| "Ana".to_string())
/// });
/// assert_eq!(out, "Hola Ana ({{2}})");
/// ```
pub fn substitute(text: &str, resolve: impl Fn(u32) -> Option<String>) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |captures: &regex::Captures<'_>| {
            captures[1]
                .parse::<u32>()
                .ok()
                .and_then(&resolve)
                .unwrap_or_else(|| captures[0].to_string())
        })
        .into_owned()
}

fn body_param<'a>(params: &'a BTreeMap<String, String>, n: u32) -> Option<&'a String> {
    params.get(&format!("param_{n}"))
}

fn header_param<'a>(params: &'a BTreeMap<String, String>, n: u32) -> Option<&'a String> {
    params
        .get(&format!("header_param_{n}"))
        .or_else(|| params.get(&format!("header_{n}")))
}

/// Short body preview with caller parameters substituted and unresolved
/// placeholders left literal, truncated to [`PREVIEW_LENGTH`] graphemes.
pub fn preview(template: &MessageTemplate, params: &BTreeMap<String, String>) -> String {
    let body = template.body_text().unwrap_or_default();
    let resolved = substitute(body, |n| body_param(params, n).cloned());
    truncate_graphemes(&resolved, PREVIEW_LENGTH)
}

fn truncate_graphemes(text: &str, limit: usize) -> String {
    text.graphemes(true).take(limit).collect()
}

/// Full ordered parameter list in the provider's component shape, mirroring
/// the `{type, parameters: [{type: "text", text}]}` wire form.
pub fn build_components(
    template: &MessageTemplate,
    params: &BTreeMap<String, String>,
) -> Vec<Value> {
    let sets = template_placeholders(template);
    let mut components = Vec::new();

    if !sets.header.is_empty() {
        let parameters: Vec<Value> = sets
            .header
            .iter()
            .map(|n| {
                let text = header_param(params, *n)
                    .cloned()
                    .unwrap_or_else(|| format!("{{{{{n}}}}}"));
                json!({ "type": "text", "text": text })
            })
            .collect();
        components.push(json!({ "type": "header", "parameters": parameters }));
    }

    if !sets.body.is_empty() {
        let parameters: Vec<Value> = sets
            .body
            .iter()
            .map(|n| {
                let text = body_param(params, *n)
                    .cloned()
                    .unwrap_or_else(|| format!("{{{{{n}}}}}"));
                json!({ "type": "text", "text": text })
            })
            .collect();
        components.push(json!({ "type": "body", "parameters": parameters }));
    }

    components
}

/// Canonical names of parameters the caller failed to supply. A caller's
/// resolution cannot be assumed complete, so senders re-check this before
/// any network call.
pub fn missing_parameters(
    template: &MessageTemplate,
    params: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    let sets = template_placeholders(template);
    let mut missing = BTreeSet::new();
    for n in &sets.header {
        if header_param(params, *n).is_none() {
            missing.insert(format!("header_param_{n}"));
        }
    }
    for n in &sets.body {
        if body_param(params, *n).is_none() {
            missing.insert(format!("param_{n}"));
        }
    }
    missing
}
