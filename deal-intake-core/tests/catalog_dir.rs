//! Catalog loading from a directory of YAML files.

use std::fs;
use std::sync::Arc;

use deal_intake_core::*;
use tempfile::TempDir;

const DICTIONARY: &str = r#"
fields:
  - field_key: borrower.authorized_party.first_name
    label: First Name
    section: borrower
  - field_key: loan_terms.first_payment_date
    label: First Payment Date
    section: loan_terms
    data_type: date
  - field_key: loan_terms.term_months
    label: Term (months)
    section: loan_terms
    data_type: number
  - field_key: loan_terms.maturity_date
    label: Maturity Date
    section: loan_terms
    data_type: date
    is_calculated: true
    calculation_formula: "{loan_terms.first_payment_date} + {loan_terms.term_months} months"
    calculation_dependencies:
      - loan_terms.first_payment_date
      - loan_terms.term_months
"#;

const PACKETS: &str = r#"
templates:
  - id: promissory_note
    fields:
      - field_key: borrower.authorized_party.first_name
        required: true
        transform: uppercase
      - field_key: loan_terms.first_payment_date
        required: true
      - field_key: loan_terms.term_months
      - field_key: loan_terms.maturity_date
packets:
  - id: ca_bridge
    templates: [promissory_note]
"#;

fn write_catalog() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("dictionary.yaml"), DICTIONARY).unwrap();
    fs::write(dir.path().join("packets.yml"), PACKETS).unwrap();
    fs::write(dir.path().join("README.txt"), "not yaml").unwrap();
    dir
}

#[tokio::test]
async fn test_directory_catalog_seeds_resolvable_store() {
    let dir = write_catalog();
    let catalog = FieldCatalog::load_from_dir(dir.path()).unwrap();
    assert_eq!(catalog.packet_ids(), vec!["ca_bridge"]);
    assert!(catalog.validate().unwrap().is_empty());

    let store = Arc::new(MemoryStore::new());
    catalog.seed(&store).await;
    let service = IntakeService::new(store);

    let resolved = service.resolve_packet_fields("ca_bridge").await.unwrap();
    assert_eq!(resolved.visible_field_keys.len(), 4);
    assert_eq!(resolved.required_field_keys.len(), 2);
    assert_eq!(
        resolved
            .field("borrower.authorized_party.first_name")
            .unwrap()
            .transform_rules,
        vec!["uppercase".to_string()]
    );
}

#[tokio::test]
async fn test_snapshot_file_seeds_deal() {
    let dir = write_catalog();
    let catalog = FieldCatalog::load_from_dir(dir.path()).unwrap();
    let snapshot_path = dir.path().join("deal.snapshot");
    fs::write(
        &snapshot_path,
        r#"
deal:
  packet_id: ca_bridge
participants:
  - role: borrower
values:
  loan_terms.first_payment_date: "2024-01-31"
  loan_terms.term_months: "1"
"#,
    )
    .unwrap();

    let snapshot = DealSnapshot::load(&snapshot_path).unwrap();
    let store = Arc::new(MemoryStore::new());
    catalog.seed(&store).await;
    snapshot.seed(&store).await.unwrap();

    let service = IntakeService::new(store);
    let borrower = snapshot.find_participant("borrower").unwrap();
    let evaluation = service
        .evaluate_deal(
            snapshot.deal.id,
            &ViewerIdentity::Participant {
                participant_id: borrower,
            },
        )
        .await
        .unwrap();
    assert_eq!(evaluation.values["loan_terms.maturity_date"], "2024-02-29");
    assert_eq!(evaluation.missing_required.len(), 1);
    assert!(evaluation.orchestration.can_edit);
}

#[test]
fn test_duplicate_keys_across_files_fail() {
    let dir = write_catalog();
    fs::write(dir.path().join("extra.yaml"), DICTIONARY).unwrap();
    let err = FieldCatalog::load_from_dir(dir.path()).unwrap_err();
    assert!(format!("{err:#}").contains("duplicate field key"));
}

#[test]
fn test_missing_directory_is_empty() {
    let dir = TempDir::new().unwrap();
    let catalog = FieldCatalog::load_from_dir(dir.path().join("absent")).unwrap();
    assert!(catalog.packet_ids().is_empty());
}

#[tokio::test]
async fn test_bundled_sample_catalog_and_deal() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("..");
    let catalog = FieldCatalog::load_from_dir(root.join("config/catalog")).unwrap();
    assert!(catalog.validate().unwrap().is_empty());

    let snapshot = DealSnapshot::load(root.join("config/deals/sequential.yaml")).unwrap();
    let store = Arc::new(MemoryStore::new());
    catalog.seed(&store).await;
    snapshot.seed(&store).await.unwrap();
    let service = IntakeService::new(store);

    let title = snapshot.find_participant("title_agent").unwrap();
    let evaluation = service
        .evaluate_deal(
            snapshot.deal.id,
            &ViewerIdentity::Participant {
                participant_id: title,
            },
        )
        .await
        .unwrap();
    assert!(evaluation.orchestration.is_waiting);
    assert_eq!(evaluation.values["loan_terms.first_payment_date"], "2024-02-29");
    assert_eq!(evaluation.values["loan_terms.maturity_date"], "2025-02-28");
    assert!(evaluation.calculations["loan_terms.extended_maturity_date"].is_waiting());
}
