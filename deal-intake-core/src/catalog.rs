//! Field Catalog
//!
//! Reference data (field dictionary, templates, packets) loaded from YAML,
//! plus deal snapshots used to seed a store for local runs.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calc::Formula;
use crate::store_memory::MemoryStore;
use crate::types::*;

// ─────────────────────────────────────────────────────────────────────────────
// YAML shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub fields: Vec<TemplateFieldDef>,
}

/// One merge tag of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateFieldDef {
    pub field_key: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub transform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketDef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Template ids in declared order
    pub templates: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    fields: Vec<FieldDefinition>,
    #[serde(default)]
    templates: Vec<TemplateDef>,
    #[serde(default)]
    packets: Vec<PacketDef>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of dictionary, template and packet definitions.
#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    fields: BTreeMap<String, FieldDefinition>,
    templates: BTreeMap<String, TemplateDef>,
    packets: BTreeMap<String, PacketDef>,
}

impl FieldCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.yaml` / `*.yml` file in `dir`, then validate.
    ///
    /// A missing directory yields an empty catalog.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut catalog = Self::new();

        if !dir.exists() {
            warn!("Catalog directory does not exist: {:?}", dir);
            return Ok(catalog);
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read catalog directory: {:?}", dir))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        paths.sort();

        for path in paths {
            if path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
            {
                debug!("Loading catalog file {:?}", path);
                catalog.load_file(&path)?;
            }
        }

        catalog.validate()?;
        info!(
            fields = catalog.fields.len(),
            templates = catalog.templates.len(),
            packets = catalog.packets.len(),
            "Loaded field catalog from {:?}",
            dir
        );
        Ok(catalog)
    }

    /// Merge one YAML file into the catalog. Duplicate ids are errors.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {:?}", path))?;
        self.load_str(&content)
            .with_context(|| format!("Failed to load catalog file: {:?}", path))
    }

    /// Merge YAML text into the catalog.
    pub fn load_str(&mut self, content: &str) -> Result<()> {
        let file: CatalogFile = serde_yaml::from_str(content).context("invalid catalog YAML")?;

        for field in file.fields {
            if self.fields.contains_key(&field.field_key) {
                bail!("duplicate field key: {}", field.field_key);
            }
            self.fields.insert(field.field_key.clone(), field);
        }
        for template in file.templates {
            if self.templates.contains_key(&template.id) {
                bail!("duplicate template id: {}", template.id);
            }
            self.templates.insert(template.id.clone(), template);
        }
        for packet in file.packets {
            if self.packets.contains_key(&packet.id) {
                bail!("duplicate packet id: {}", packet.id);
            }
            self.packets.insert(packet.id.clone(), packet);
        }
        Ok(())
    }

    /// Check cross references. Unknown templates in a packet are errors;
    /// dictionary and formula inconsistencies are logged and returned.
    pub fn validate(&self) -> Result<Vec<String>> {
        for packet in self.packets.values() {
            if let Some(missing) = packet
                .templates
                .iter()
                .find(|t| !self.templates.contains_key(*t))
            {
                return Err(anyhow!(
                    "packet {} references unknown template {}",
                    packet.id,
                    missing
                ));
            }
        }

        let mut warnings = Vec::new();

        for template in self.templates.values() {
            for field in &template.fields {
                if !self.fields.contains_key(&field.field_key) {
                    warnings.push(format!(
                        "template {} maps unknown field key {}",
                        template.id, field.field_key
                    ));
                }
            }
        }

        for def in self.fields.values().filter(|d| d.is_calculated) {
            let Some(text) = &def.calculation_formula else {
                warnings.push(format!("calculated field {} has no formula", def.field_key));
                continue;
            };
            match text.parse::<Formula>() {
                Ok(formula) => {
                    let declared: HashSet<&str> = def
                        .calculation_dependencies
                        .iter()
                        .map(String::as_str)
                        .collect();
                    for key in formula.referenced_fields() {
                        if !declared.contains(key) {
                            warnings.push(format!(
                                "calculated field {} references undeclared dependency {}",
                                def.field_key, key
                            ));
                        }
                    }
                }
                Err(e) => warnings.push(format!(
                    "calculated field {} has an invalid formula: {e}",
                    def.field_key
                )),
            }
        }

        for warning in &warnings {
            warn!("{}", warning);
        }
        Ok(warnings)
    }

    pub fn field(&self, field_key: &str) -> Option<&FieldDefinition> {
        self.fields.get(field_key)
    }

    pub fn packet(&self, packet_id: &str) -> Option<&PacketDef> {
        self.packets.get(packet_id)
    }

    pub fn packet_ids(&self) -> Vec<&str> {
        self.packets.keys().map(String::as_str).collect()
    }

    /// Template field maps grouped by template id, merge tags in declared order.
    pub fn template_field_maps(&self) -> Vec<TemplateFieldMap> {
        self.templates
            .values()
            .flat_map(|t| {
                t.fields.iter().map(|f| TemplateFieldMap {
                    template_id: t.id.clone(),
                    field_key: f.field_key.clone(),
                    required_flag: f.required,
                    transform_rule: f.transform.clone(),
                })
            })
            .collect()
    }

    /// Install all reference data into `store`.
    pub async fn seed(&self, store: &MemoryStore) {
        for def in self.fields.values() {
            store.insert_field_definition(def.clone()).await;
        }
        for map in self.template_field_maps() {
            store.insert_template_field_map(map).await;
        }
        for packet in self.packets.values() {
            store
                .insert_packet(packet.id.clone(), packet.templates.clone())
                .await;
        }
        debug!(
            fields = self.fields.len(),
            packets = self.packets.len(),
            "Seeded store from catalog"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deal snapshots
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDeal {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub packet_id: String,
    #[serde(default)]
    pub status: DealStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotParticipant {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: ParticipantRole,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub sequence_order: Option<i32>,
    #[serde(default = "default_participant_status")]
    pub status: ParticipantStatus,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_participant_status() -> ParticipantStatus {
    ParticipantStatus::Invited
}

/// One deal with its roster and stored values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealSnapshot {
    pub deal: SnapshotDeal,
    #[serde(default)]
    pub participants: Vec<SnapshotParticipant>,
    #[serde(default)]
    pub values: FieldValues,
}

impl DealSnapshot {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read deal snapshot: {:?}", path))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse deal snapshot: {:?}", path))
    }

    pub fn deal(&self) -> Deal {
        Deal {
            id: self.deal.id,
            packet_id: self.deal.packet_id.clone(),
            status: self.deal.status,
            status_changed_at: Utc::now(),
        }
    }

    pub fn participants(&self) -> Vec<DealParticipant> {
        self.participants
            .iter()
            .map(|p| {
                let completed_at = match (p.status, p.completed_at) {
                    (ParticipantStatus::Completed, None) => Some(Utc::now()),
                    (_, at) => at,
                };
                DealParticipant {
                    id: p.id,
                    deal_id: self.deal.id,
                    role: p.role,
                    user_id: p.user_id,
                    email: p.email.clone(),
                    access_method: if p.user_id.is_some() {
                        AccessMethod::Login
                    } else {
                        AccessMethod::MagicLink
                    },
                    sequence_order: p.sequence_order,
                    status: p.status,
                    completed_at,
                }
            })
            .collect()
    }

    /// Find a participant by id or, failing that, by role name.
    pub fn find_participant(&self, id_or_role: &str) -> Option<Uuid> {
        if let Ok(id) = id_or_role.parse::<Uuid>() {
            return self.participants.iter().find(|p| p.id == id).map(|p| p.id);
        }
        self.participants
            .iter()
            .find(|p| p.role.as_str() == id_or_role)
            .map(|p| p.id)
    }

    /// Install the deal, its roster and values into `store`.
    pub async fn seed(&self, store: &MemoryStore) -> Result<()> {
        use crate::store::IntakeStore;

        store.insert_deal(self.deal()).await;
        for participant in self.participants() {
            store.insert_participant(participant).await;
        }
        let values: Vec<FieldValue> = self
            .values
            .iter()
            .map(|(k, v)| FieldValue::new(self.deal.id, k, v, None))
            .collect();
        store.upsert_field_values(self.deal.id, &values).await?;

        debug!(
            deal_id = %self.deal.id,
            participants = self.participants.len(),
            values = values.len(),
            "Seeded deal snapshot"
        );
        Ok(())
    }
}
