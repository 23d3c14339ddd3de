use crate::domain::prediction::{Explanation, Prediction};
use crate::domain::repositories::SnapshotRepository;
use crate::domain::signal::InstrumentKey;
use crate::domain::window::FeatureWindow;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

pub struct SqliteSnapshotRepository {
    pool: SqlitePool,
}

impl SqliteSnapshotRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Serde name of a unit-like enum value (`"exact_shapley"` -> `exact_shapley`).
fn label<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn save_windows(&self, windows: &[FeatureWindow]) -> Result<()> {
        let exported_at = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for window in windows {
            sqlx::query(
                r#"
                INSERT INTO feature_windows
                    (instrument, family, latest_json, latest_observed_at, stats_json, last_update, event_count, exported_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(instrument, family) DO UPDATE SET
                    latest_json = excluded.latest_json,
                    latest_observed_at = excluded.latest_observed_at,
                    stats_json = excluded.stats_json,
                    last_update = excluded.last_update,
                    event_count = excluded.event_count,
                    exported_at = excluded.exported_at
                "#,
            )
            .bind(window.instrument_key().as_str())
            .bind(window.family().as_str())
            .bind(serde_json::to_string(window.latest())?)
            .bind(window.latest().observed_at.timestamp_millis())
            .bind(serde_json::to_string(window.field_stats())?)
            .bind(window.last_update().timestamp_millis())
            .bind(window.event_count() as i64)
            .bind(exported_at)
            .execute(&mut *tx)
            .await
            .context(format!(
                "Failed to save window {}/{}",
                window.instrument_key(),
                window.family()
            ))?;
        }
        tx.commit().await.context("Failed to commit window export")?;
        debug!("Exported {} feature windows", windows.len());
        Ok(())
    }

    async fn save_prediction(&self, prediction: &Prediction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO predictions
                (id, instrument, decision_time, target, value, confidence, probability_up,
                 model_version, feature_vector_ref, lead_model, degraded, payload_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(prediction.id.to_string())
        .bind(prediction.instrument_key.as_str())
        .bind(prediction.decision_time.timestamp_millis())
        .bind(prediction.target.to_string())
        .bind(prediction.value)
        .bind(prediction.confidence)
        .bind(prediction.probability_up)
        .bind(&prediction.model_version)
        .bind(prediction.feature_vector_ref.as_str())
        .bind(&prediction.lead_model)
        .bind(prediction.degraded)
        .bind(serde_json::to_string(prediction)?)
        .execute(&self.pool)
        .await
        .context("Failed to save prediction")?;
        Ok(())
    }

    async fn save_explanation(&self, explanation: &Explanation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO explanations
                (prediction_id, feature_vector_ref, model_version, baseline_value, method, attributions_json, generated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(explanation.prediction_id.to_string())
        .bind(explanation.feature_vector_ref.as_str())
        .bind(&explanation.model_version)
        .bind(explanation.baseline_value)
        .bind(label(&explanation.method)?)
        .bind(serde_json::to_string(&explanation.attributions)?)
        .bind(explanation.generated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save explanation")?;
        Ok(())
    }

    async fn recent_predictions(
        &self,
        instrument: &InstrumentKey,
        limit: usize,
    ) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(
            "SELECT payload_json FROM predictions WHERE instrument = ? ORDER BY decision_time DESC LIMIT ?",
        )
        .bind(instrument.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut predictions = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload_json")?;
            predictions.push(
                serde_json::from_str(&payload).context("Failed to decode stored prediction")?,
            );
        }
        Ok(predictions)
    }
}
