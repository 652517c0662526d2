//! Packet Field Resolution
//!
//! Aggregates the field maps of every template in a packet into one
//! deduplicated, required-annotated field set. Resolution is a pure function
//! of the dictionary and template-map state: re-running it on the same state
//! produces an equal result, so callers may retry freely.
//!
//! Required-ness is an OR across templates. There is no notion of an
//! optional mapping overriding a required one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::IntakeError;
use crate::store::IntakeStore;
use crate::types::*;

/// Resolves packets against an [`IntakeStore`].
pub struct PacketFieldResolver {
    store: Arc<dyn IntakeStore>,
}

impl PacketFieldResolver {
    pub fn new(store: Arc<dyn IntakeStore>) -> Self {
        Self { store }
    }

    /// Resolve the visible and required fields for a packet.
    ///
    /// Packets without templates (including unknown packets) resolve to the
    /// empty set rather than an error.
    pub async fn resolve(&self, packet_id: &str) -> Result<ResolvedFieldSet, IntakeError> {
        let template_ids = self.store.load_packet_templates(packet_id).await?;
        if template_ids.is_empty() {
            debug!(packet_id, "Packet has no templates, nothing to resolve");
            return Ok(ResolvedFieldSet::empty(packet_id));
        }

        let maps = self.store.load_template_field_maps(&template_ids).await?;
        let visible = dedupe_field_keys(&maps);
        if visible.is_empty() {
            debug!(packet_id, templates = template_ids.len(), "Packet templates map no fields");
            return Ok(ResolvedFieldSet::empty(packet_id));
        }

        let definitions = self.store.load_field_dictionary(&visible).await?;
        let resolved = assemble(packet_id, &maps, definitions);

        debug!(
            packet_id,
            templates = template_ids.len(),
            visible = resolved.visible_field_keys.len(),
            required = resolved.required_field_keys.len(),
            sections = resolved.sections.len(),
            "Resolved packet fields"
        );
        Ok(resolved)
    }
}

fn dedupe_field_keys(maps: &[TemplateFieldMap]) -> Vec<String> {
    let mut seen = HashSet::new();
    maps.iter()
        .filter(|m| seen.insert(m.field_key.as_str()))
        .map(|m| m.field_key.clone())
        .collect()
}

/// Build a resolved set from template maps and the dictionary entries they reference.
///
/// Keys are ordered by first appearance in `maps`. Keys with no dictionary
/// entry stay visible (and required, if flagged) but produce no field.
pub fn assemble(
    packet_id: &str,
    maps: &[TemplateFieldMap],
    definitions: Vec<FieldDefinition>,
) -> ResolvedFieldSet {
    let visible_field_keys = dedupe_field_keys(maps);

    let mut required: HashSet<&str> = HashSet::new();
    let mut required_field_keys = Vec::new();
    let mut transform_rules: HashMap<&str, Vec<String>> = HashMap::new();

    for map in maps {
        if map.required_flag && required.insert(map.field_key.as_str()) {
            required_field_keys.push(map.field_key.clone());
        }
        if let Some(rule) = &map.transform_rule {
            let rules = transform_rules.entry(map.field_key.as_str()).or_default();
            if !rules.contains(rule) {
                rules.push(rule.clone());
            }
        }
    }

    let mut by_key: HashMap<String, FieldDefinition> = definitions
        .into_iter()
        .map(|d| (d.field_key.clone(), d))
        .collect();

    let mut fields: Vec<ResolvedField> = Vec::with_capacity(visible_field_keys.len());
    for key in &visible_field_keys {
        match by_key.remove(key) {
            Some(definition) => fields.push(ResolvedField {
                is_required: required.contains(key.as_str()),
                transform_rules: transform_rules.remove(key.as_str()).unwrap_or_default(),
                definition,
            }),
            None => warn!(
                packet_id,
                field_key = %key,
                "Template maps a field missing from the dictionary"
            ),
        }
    }

    fields.sort_by(|a, b| {
        section_rank(a.section())
            .cmp(&section_rank(b.section()))
            .then_with(|| a.section().cmp(b.section()))
            .then_with(|| a.definition.label.cmp(&b.definition.label))
            .then_with(|| a.field_key().cmp(b.field_key()))
    });

    let mut fields_by_section: BTreeMap<String, Vec<ResolvedField>> = BTreeMap::new();
    let mut sections: Vec<String> = Vec::new();
    for field in &fields {
        let section = field.section().to_string();
        if !fields_by_section.contains_key(&section) {
            sections.push(section.clone());
        }
        fields_by_section.entry(section).or_default().push(field.clone());
    }

    ResolvedFieldSet {
        packet_id: packet_id.to_string(),
        visible_field_keys,
        required_field_keys,
        fields,
        fields_by_section,
        sections,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completeness
// ─────────────────────────────────────────────────────────────────────────────

/// Required fields with no value, in resolved order, optionally for one section.
pub fn missing_required_fields(
    resolved: &ResolvedFieldSet,
    values: &FieldValues,
    section: Option<&str>,
) -> Vec<FieldDefinition> {
    resolved
        .fields
        .iter()
        .filter(|f| f.is_required)
        .filter(|f| section.is_none_or(|s| f.section() == s))
        .filter(|f| !has_value(values, f.field_key()))
        .map(|f| f.definition.clone())
        .collect()
}

pub fn is_section_complete(
    resolved: &ResolvedFieldSet,
    values: &FieldValues,
    section: &str,
) -> bool {
    missing_required_fields(resolved, values, Some(section)).is_empty()
}

pub fn is_packet_complete(resolved: &ResolvedFieldSet, values: &FieldValues) -> bool {
    missing_required_fields(resolved, values, None).is_empty()
}

/// Fill state of one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionProgress {
    pub section: String,
    pub total_fields: usize,
    pub required_fields: usize,
    pub filled_required: usize,
    pub percent_complete: f32,
}

/// Per-section progress in display order. Sections without required fields are 100%.
pub fn section_progress(resolved: &ResolvedFieldSet, values: &FieldValues) -> Vec<SectionProgress> {
    resolved
        .sections
        .iter()
        .map(|section| {
            let fields = resolved
                .fields_by_section
                .get(section)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let required_fields = fields.iter().filter(|f| f.is_required).count();
            let filled_required = fields
                .iter()
                .filter(|f| f.is_required && has_value(values, f.field_key()))
                .count();
            let percent_complete = if required_fields == 0 {
                100.0
            } else {
                (filled_required as f32 / required_fields as f32) * 100.0
            };
            SectionProgress {
                section: section.clone(),
                total_fields: fields.len(),
                required_fields,
                filled_required,
                percent_complete,
            }
        })
        .collect()
}

/// Calculated fields of the set that carry a formula, in resolved order.
pub fn calculated_fields(resolved: &ResolvedFieldSet) -> Vec<CalculatedField> {
    resolved
        .fields
        .iter()
        .filter_map(|f| CalculatedField::from_definition(&f.definition))
        .collect()
}
