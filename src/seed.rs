//! Main pipeline seeding
//!
//! Every scope gets one main PERSON and one main CHURCH pipeline with the
//! standard stage set. Existing pipelines are left alone; a main pipeline
//! with no stages gets the standard ones.

use crate::directory;
use crate::error::EngineResult;
use crate::models::{NewPipeline, Pipeline, PipelineType, StageInput};
use crate::store::Transaction;
use chrono::{DateTime, Utc};
use tracing::info;

pub const PERSON_STAGES: &[&str] = &["PROMOTION", "INFORMATION", "INVITATION", "CONFIRMATION", "AUTOMATION"];

pub const CHURCH_STAGES: &[&str] = &[
    "PROMOTION",
    "INFORMATION",
    "INVITATION",
    "CONFIRMATION",
    "EN42",
    "AUTOMATION",
];

const STAGE_COLORS: &[&str] = &["#3498db", "#2ecc71", "#f1c40f", "#e67e22", "#e74c3c", "#9b59b6"];

fn standard_stages(pipeline_type: PipelineType) -> Vec<StageInput> {
    let (names, noun) = match pipeline_type {
        PipelineType::Church => (CHURCH_STAGES, "churches"),
        _ => (PERSON_STAGES, "people"),
    };
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut input = StageInput::new(*name, i as i32 + 1)
                .with_color(STAGE_COLORS[i % STAGE_COLORS.len()]);
            input.description = Some(format!("Standard {} stage for {}", name, noun));
            input
        })
        .collect()
}

/// Returns the pipelines that were created or given stages
pub async fn ensure_main_pipelines<T: Transaction>(
    tx: &mut T,
    scope: &str,
    now: DateTime<Utc>,
) -> EngineResult<Vec<Pipeline>> {
    let mut touched = Vec::new();

    for (pipeline_type, label) in [(PipelineType::Person, "People"), (PipelineType::Church, "Church")] {
        let pipeline = match tx.find_main_pipeline(pipeline_type, scope).await? {
            Some(existing) => {
                if !tx.list_stages(existing.id).await?.is_empty() {
                    continue;
                }
                existing
            }
            None => {
                let mut input = NewPipeline::new(
                    format!("{} {} Pipeline", scope, label),
                    pipeline_type.as_str(),
                    scope,
                    true,
                );
                input.description = Some(format!(
                    "Main pipeline for tracking {} contacts in {}",
                    label.to_lowercase(),
                    scope
                ));
                directory::create_pipeline(tx, input, now).await?
            }
        };

        directory::upsert_stages(tx, pipeline.id, standard_stages(pipeline_type), now).await?;
        info!("🌱 Seeded main {} pipeline for scope '{}'", pipeline_type, scope);
        touched.push(pipeline);
    }

    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemRef, StageInput};
    use crate::placement;
    use crate::store::{MemoryStore, Store};

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();

        let created = ensure_main_pipelines(&mut tx, "north", now).await.unwrap();
        assert_eq!(created.len(), 2);
        let church = created
            .iter()
            .find(|p| p.pipeline_type == PipelineType::Church)
            .unwrap();
        let names: Vec<String> = tx
            .list_stages(church.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, CHURCH_STAGES);

        assert!(ensure_main_pipelines(&mut tx, "north", now).await.unwrap().is_empty());
        assert_eq!(ensure_main_pipelines(&mut tx, "south", now).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_seed_keeps_custom_stages_and_placements() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();
        let created = ensure_main_pipelines(&mut tx, "north", now).await.unwrap();
        let person = created
            .iter()
            .find(|p| p.pipeline_type == PipelineType::Person)
            .unwrap();

        directory::upsert_stages(&mut tx, person.id, vec![StageInput::new("Only", 1)], now)
            .await
            .unwrap();
        placement::place_item(&mut tx, ItemRef::new("person:1"), person.id, None, now)
            .await
            .unwrap();

        ensure_main_pipelines(&mut tx, "north", now).await.unwrap();
        assert_eq!(tx.list_stages(person.id).await.unwrap().len(), 1);
        assert_eq!(tx.count_placements_in_pipeline(person.id).await.unwrap(), 1);
    }
}
