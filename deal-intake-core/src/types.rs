//! Deal Intake Types
//!
//! Reference data (field dictionary, template field maps), per-deal facts
//! (values, participants, status) and the derived views computed from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ParseEnumError;

/// Snapshot of a deal's values keyed by field key.
pub type FieldValues = BTreeMap<String, String>;

/// Fixed UI ordering of dictionary sections. Unknown sections sort after these.
pub const SECTION_ORDER: [&str; 8] = [
    "borrower",
    "co_borrower",
    "property",
    "loan_terms",
    "seller",
    "title",
    "escrow",
    "other",
];

/// Position of a section in [`SECTION_ORDER`]; unknown sections share the last rank.
pub fn section_rank(section: &str) -> usize {
    SECTION_ORDER
        .iter()
        .position(|s| *s == section)
        .unwrap_or(SECTION_ORDER.len())
}

/// A value counts as present when it is non-blank after trimming.
pub fn has_value(values: &FieldValues, field_key: &str) -> bool {
    values
        .get(field_key)
        .is_some_and(|v| !v.trim().is_empty())
}

fn default_section() -> String {
    "other".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Field dictionary
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Text,
    Number,
    Currency,
    Date,
    Percentage,
    Boolean,
    Phone,
    Email,
    Ssn,
    Select,
    Section,
    Label,
    Template,
    Action,
    File,
    #[serde(other)]
    Other,
}

impl DataType {
    /// Display-only types never carry a deal value.
    pub fn holds_value(&self) -> bool {
        !matches!(
            self,
            Self::Section | Self::Label | Self::Template | Self::Action
        )
    }
}

/// Canonical dictionary entry for one field key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Stable dotted path, e.g. `borrower.authorized_party.first_name`
    pub field_key: String,
    pub label: String,
    /// UI grouping bucket
    #[serde(default = "default_section")]
    pub section: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub is_calculated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation_formula: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calculation_dependencies: Vec<String>,
    /// Regular expression the trimmed value must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_rule: Option<String>,
}

impl FieldDefinition {
    pub fn new(
        field_key: impl Into<String>,
        label: impl Into<String>,
        section: impl Into<String>,
        data_type: DataType,
    ) -> Self {
        Self {
            field_key: field_key.into(),
            label: label.into(),
            section: section.into(),
            data_type,
            default_value: None,
            is_calculated: false,
            calculation_formula: None,
            calculation_dependencies: Vec::new(),
            validation_rule: None,
        }
    }

    /// Mark as calculated with a formula and its dependencies
    pub fn calculated<I, S>(mut self, formula: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.is_calculated = true;
        self.calculation_formula = Some(formula.into());
        self.calculation_dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_validation(mut self, rule: impl Into<String>) -> Self {
        self.validation_rule = Some(rule.into());
        self
    }
}

/// Association of one template to one field key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFieldMap {
    pub template_id: String,
    pub field_key: String,
    #[serde(default)]
    pub required_flag: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_rule: Option<String>,
}

impl TemplateFieldMap {
    pub fn new(
        template_id: impl Into<String>,
        field_key: impl Into<String>,
        required: bool,
    ) -> Self {
        Self {
            template_id: template_id.into(),
            field_key: field_key.into(),
            required_flag: required,
            transform_rule: None,
        }
    }

    pub fn with_transform(mut self, rule: impl Into<String>) -> Self {
        self.transform_rule = Some(rule.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolved view
// ─────────────────────────────────────────────────────────────────────────────

/// A dictionary entry annotated for one packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedField {
    #[serde(flatten)]
    pub definition: FieldDefinition,
    /// True if any template in the packet requires the field
    pub is_required: bool,
    /// Deduplicated union of all templates' transform rules
    #[serde(default)]
    pub transform_rules: Vec<String>,
}

impl ResolvedField {
    pub fn field_key(&self) -> &str {
        &self.definition.field_key
    }

    pub fn section(&self) -> &str {
        &self.definition.section
    }
}

/// All fields relevant to one packet, deduplicated and required-annotated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFieldSet {
    pub packet_id: String,
    pub visible_field_keys: Vec<String>,
    pub required_field_keys: Vec<String>,
    /// Sorted by section order, then label
    pub fields: Vec<ResolvedField>,
    pub fields_by_section: BTreeMap<String, Vec<ResolvedField>>,
    /// Sections with at least one field, in display order
    pub sections: Vec<String>,
}

impl ResolvedFieldSet {
    pub fn empty(packet_id: impl Into<String>) -> Self {
        Self {
            packet_id: packet_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.visible_field_keys.is_empty()
    }

    pub fn is_required(&self, field_key: &str) -> bool {
        self.required_field_keys.iter().any(|k| k == field_key)
    }

    pub fn is_visible(&self, field_key: &str) -> bool {
        self.visible_field_keys.iter().any(|k| k == field_key)
    }

    pub fn field(&self, field_key: &str) -> Option<&ResolvedField> {
        self.fields.iter().find(|f| f.field_key() == field_key)
    }
}

/// One stored value with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub deal_id: Uuid,
    pub field_key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl FieldValue {
    pub fn new(
        deal_id: Uuid,
        field_key: impl Into<String>,
        value: impl Into<String>,
        updated_by: Option<Uuid>,
    ) -> Self {
        Self {
            deal_id,
            field_key: field_key.into(),
            value: value.into(),
            updated_by,
            updated_at: Utc::now(),
        }
    }
}

/// Collapse stored values into a snapshot. Later rows win.
pub fn values_snapshot(values: &[FieldValue]) -> FieldValues {
    values
        .iter()
        .map(|v| (v.field_key.clone(), v.value.clone()))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Calculation
// ─────────────────────────────────────────────────────────────────────────────

/// The calculation-relevant slice of a calculated [`FieldDefinition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculatedField {
    pub field_key: String,
    pub formula: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl CalculatedField {
    pub fn new<I, S>(
        field_key: impl Into<String>,
        formula: impl Into<String>,
        dependencies: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field_key: field_key.into(),
            formula: formula.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }

    /// `None` unless the definition is calculated and carries a formula.
    pub fn from_definition(def: &FieldDefinition) -> Option<Self> {
        if !def.is_calculated {
            return None;
        }
        let formula = def.calculation_formula.as_ref()?;
        Some(Self {
            field_key: def.field_key.clone(),
            formula: formula.clone(),
            dependencies: def.calculation_dependencies.clone(),
        })
    }
}

/// Outcome of one calculated field in one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub field_key: String,
    pub value: Option<String>,
    pub computed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CalculationResult {
    pub fn computed(field_key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field_key: field_key.into(),
            value: Some(value.into()),
            computed: true,
            error: None,
        }
    }

    /// Dependencies not yet satisfied. Not an error.
    pub fn waiting(field_key: impl Into<String>) -> Self {
        Self {
            field_key: field_key.into(),
            value: None,
            computed: false,
            error: None,
        }
    }

    pub fn failed(field_key: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            field_key: field_key.into(),
            value: None,
            computed: false,
            error: Some(error.to_string()),
        }
    }

    pub fn is_waiting(&self) -> bool {
        !self.computed && self.error.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Participants
// ─────────────────────────────────────────────────────────────────────────────

/// Participant lifecycle. Monotonic: invited < in_progress < completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    InProgress,
    Completed,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invited => "invited",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    fn order(&self) -> u8 {
        match self {
            Self::Invited => 0,
            Self::InProgress => 1,
            Self::Completed => 2,
        }
    }

    /// Only forward moves are legal.
    pub fn can_transition_to(&self, target: ParticipantStatus) -> bool {
        target.order() > self.order()
    }
}

impl FromStr for ParticipantStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invited" => Ok(Self::Invited),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => Err(ParseEnumError::new("participant status", s)),
        }
    }
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    // Internal
    Admin,
    Staff,
    // External
    Borrower,
    CoBorrower,
    Broker,
    Lender,
    TitleAgent,
    Other,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Staff => "staff",
            Self::Borrower => "borrower",
            Self::CoBorrower => "co_borrower",
            Self::Broker => "broker",
            Self::Lender => "lender",
            Self::TitleAgent => "title_agent",
            Self::Other => "other",
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Admin | Self::Staff)
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMethod {
    Login,
    #[default]
    MagicLink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealParticipant {
    pub id: Uuid,
    pub deal_id: Uuid,
    pub role: ParticipantRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub access_method: AccessMethod,
    /// Turn order; `None` for every participant means parallel mode
    #[serde(default)]
    pub sequence_order: Option<i32>,
    pub status: ParticipantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DealParticipant {
    /// A freshly invited participant
    pub fn new(deal_id: Uuid, role: ParticipantRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            deal_id,
            role,
            user_id: None,
            email: None,
            access_method: AccessMethod::default(),
            sequence_order: None,
            status: ParticipantStatus::Invited,
            completed_at: None,
        }
    }

    pub fn with_sequence(mut self, order: i32) -> Self {
        self.sequence_order = Some(order);
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self.access_method = AccessMethod::Login;
        self
    }

    pub fn with_status(mut self, status: ParticipantStatus) -> Self {
        self.status = status;
        if status == ParticipantStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == ParticipantStatus::Completed
    }

    pub fn is_internal(&self) -> bool {
        self.role.is_internal()
    }
}

/// The caller, injected explicitly. The core never reads session storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ViewerIdentity {
    /// Authenticated internal user
    Staff { user_id: Uuid },
    /// External party holding a magic-link session for one participant row
    Participant { participant_id: Uuid },
    /// Logged-in external user, matched through `DealParticipant::user_id`
    Account { user_id: Uuid },
}

impl ViewerIdentity {
    pub fn is_staff(&self) -> bool {
        matches!(self, Self::Staff { .. })
    }

    /// User id recorded as `updated_by` provenance, when known
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::Staff { user_id } | Self::Account { user_id } => Some(*user_id),
            Self::Participant { .. } => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deal
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    #[default]
    Draft,
    Ready,
    Generated,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Generated => "generated",
        }
    }

    /// Ready and generated deals are signed off; required edits revert them.
    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Ready | Self::Generated)
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    /// Bound for the deal's lifetime
    pub packet_id: String,
    #[serde(default)]
    pub status: DealStatus,
    #[serde(default = "Utc::now")]
    pub status_changed_at: DateTime<Utc>,
}

impl Deal {
    pub fn new(packet_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            packet_id: packet_id.into(),
            status: DealStatus::Draft,
            status_changed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_rank_unknown_sorts_last() {
        assert_eq!(section_rank("borrower"), 0);
        assert_eq!(section_rank("other"), 7);
        assert_eq!(section_rank("appraisal"), SECTION_ORDER.len());
    }

    #[test]
    fn test_has_value_trims() {
        let mut values = FieldValues::new();
        values.insert("a".into(), "   ".into());
        values.insert("b".into(), " x ".into());
        assert!(!has_value(&values, "a"));
        assert!(has_value(&values, "b"));
        assert!(!has_value(&values, "c"));
    }

    #[test]
    fn test_field_definition_yaml_defaults() {
        let yaml = r#"
        field_key: loan_terms.maturity_date
        label: Maturity Date
        section: loan_terms
        data_type: date
        is_calculated: true
        calculation_formula: "{loan_terms.first_payment_date} + {loan_terms.term_months} months"
        calculation_dependencies:
          - loan_terms.first_payment_date
          - loan_terms.term_months
        "#;
        let def: FieldDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.data_type, DataType::Date);
        assert_eq!(def.calculation_dependencies.len(), 2);

        let calc = CalculatedField::from_definition(&def).unwrap();
        assert_eq!(calc.field_key, "loan_terms.maturity_date");

        let unknown: FieldDefinition =
            serde_yaml::from_str("field_key: x\nlabel: X\ndata_type: signature").unwrap();
        assert_eq!(unknown.data_type, DataType::Other);
        assert_eq!(unknown.section, "other");
    }

    #[test]
    fn test_participant_status_is_monotonic() {
        use ParticipantStatus::*;
        assert!(Invited.can_transition_to(InProgress));
        assert!(Invited.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!InProgress.can_transition_to(InProgress));
        assert_eq!("in_progress".parse::<ParticipantStatus>(), Ok(InProgress));
        assert!("done".parse::<ParticipantStatus>().is_err());
    }

    #[test]
    fn test_viewer_identity_serde() {
        let id = Uuid::new_v4();
        let viewer = ViewerIdentity::Participant { participant_id: id };
        let json = serde_json::to_value(viewer).unwrap();
        assert_eq!(json["kind"], "participant");
        assert!(!viewer.is_staff());
        assert_eq!(viewer.user_id(), None);
    }
}
