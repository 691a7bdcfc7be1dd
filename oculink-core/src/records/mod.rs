//! Granular clinical-record updates.
//!
//! A monolithic save on the parent record re-runs every aggregate
//! validation and cascades partial-write failures across unrelated
//! sections. These operations instead build field-scoped patches that the
//! store applies atomically, bypassing parent-document validation and
//! touching only the targeted subtree plus the audit fields.

mod validate;

pub use validate::{
    validate_addition, validate_axis, validate_cylinder, validate_iop, validate_sphere,
    validate_visual_acuity,
};

use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use chrono::Utc;
use oculink_model::{ExamId, RecordId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::info;

/// One atomic field-scoped patch. `set` keys are dotted subtree paths;
/// `add_to_set` entries are idempotent array inserts.
#[derive(Debug, Clone, Serialize)]
pub struct GranularUpdate {
    pub record: RecordId,
    pub set: Map<String, Value>,
    pub add_to_set: Map<String, Value>,
}

impl GranularUpdate {
    fn new(record: RecordId, user: &UserId) -> Self {
        let mut set = Map::new();
        set.insert("updated_by".into(), json!(user.as_str()));
        set.insert("updated_at".into(), json!(Utc::now()));
        Self {
            record,
            set,
            add_to_set: Map::new(),
        }
    }

    /// Dotted paths this update writes, for audit logging.
    pub fn touched_fields(&self) -> Vec<&str> {
        self.set
            .keys()
            .chain(self.add_to_set.keys())
            .map(String::as_str)
            .collect()
    }
}

/// Store-side primitive: `findByIdAndUpdate` semantics, validation
/// bypassed, returns the updated record.
#[async_trait]
pub trait RecordPatchStore: Send + Sync {
    async fn apply(&self, update: &GranularUpdate) -> Result<Value>;
}

/// Per-eye refraction values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EyeRefraction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sphere: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cylinder: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addition: Option<f64>,
}

impl EyeRefraction {
    fn validate(&self) -> Result<()> {
        if let Some(sphere) = self.sphere {
            validate_sphere(sphere)?;
        }
        if let Some(cylinder) = self.cylinder {
            validate_cylinder(cylinder)?;
        }
        if let Some(axis) = self.axis {
            validate_axis(axis)?;
        }
        if let Some(addition) = self.addition {
            validate_addition(addition)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefractionSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub od: Option<EyeRefraction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<EyeRefraction>,
}

impl RefractionSection {
    fn validate(&self) -> Result<()> {
        if let Some(od) = &self.od {
            od.validate()?;
        }
        if let Some(os) = &self.os {
            os.validate()?;
        }
        Ok(())
    }
}

/// Payload for `update_refraction`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefractionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam: Option<ExamId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objective: Option<RefractionSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subjective: Option<RefractionSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_prescription: Option<RefractionSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisEntry {
    pub code: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub laterality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreatmentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medications: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifestyle: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrals: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_education: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IopUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub od: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measured_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EyeVisualAcuity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncorrected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualAcuityUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub od: Option<EyeVisualAcuity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<EyeVisualAcuity>,
}

/// Field-scoped update operations over clinical records.
#[derive(Clone)]
pub struct GranularRecordUpdater {
    store: Arc<dyn RecordPatchStore>,
}

impl std::fmt::Debug for GranularRecordUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GranularRecordUpdater").finish()
    }
}

impl GranularRecordUpdater {
    pub fn new(store: Arc<dyn RecordPatchStore>) -> Self {
        Self { store }
    }

    async fn apply(&self, update: GranularUpdate, user: &UserId, operation: &str) -> Result<Value> {
        info!(
            record = %update.record,
            user = %user,
            operation,
            fields = ?update.touched_fields(),
            "granular record update"
        );
        self.store.apply(&update).await
    }

    pub async fn update_refraction(
        &self,
        record: RecordId,
        payload: RefractionUpdate,
        user: UserId,
    ) -> Result<Value> {
        let mut update = GranularUpdate::new(record, &user);
        if let Some(exam) = &payload.exam {
            update.set.insert("exam".into(), json!(exam.as_str()));
        }
        for (path, section) in [
            ("refraction.objective", &payload.objective),
            ("refraction.subjective", &payload.subjective),
            ("refraction.final_prescription", &payload.final_prescription),
        ] {
            if let Some(section) = section {
                section.validate()?;
                update.set.insert(path.into(), serde_json::to_value(section)?);
            }
        }
        self.apply(update, &user, "update_refraction").await
    }

    pub async fn update_diagnosis(
        &self,
        record: RecordId,
        diagnoses: Vec<DiagnosisEntry>,
        user: UserId,
    ) -> Result<Value> {
        for (index, entry) in diagnoses.iter().enumerate() {
            if entry.code.trim().is_empty() || entry.description.trim().is_empty() {
                return Err(IntegrationError::validation(
                    format!("diagnoses[{index}]"),
                    "code and description are required",
                ));
            }
        }
        let mut update = GranularUpdate::new(record, &user);
        update
            .set
            .insert("diagnoses".into(), serde_json::to_value(&diagnoses)?);
        self.apply(update, &user, "update_diagnosis").await
    }

    pub async fn update_treatment(
        &self,
        record: RecordId,
        payload: TreatmentUpdate,
        user: UserId,
    ) -> Result<Value> {
        let mut update = GranularUpdate::new(record, &user);
        for (path, value) in [
            ("plan.medications", &payload.medications),
            ("plan.lifestyle", &payload.lifestyle),
            ("plan.follow_up", &payload.follow_up),
            ("plan.referrals", &payload.referrals),
            ("plan.patient_education", &payload.patient_education),
        ] {
            if let Some(value) = value {
                update.set.insert(path.into(), value.clone());
            }
        }
        self.apply(update, &user, "update_treatment").await
    }

    pub async fn update_iop(
        &self,
        record: RecordId,
        payload: IopUpdate,
        user: UserId,
    ) -> Result<Value> {
        if let Some(od) = payload.od {
            validate_iop(od)?;
        }
        if let Some(os) = payload.os {
            validate_iop(os)?;
        }
        let mut update = GranularUpdate::new(record, &user);
        update
            .set
            .insert("examinations.iop".into(), serde_json::to_value(&payload)?);
        self.apply(update, &user, "update_iop").await
    }

    pub async fn update_visual_acuity(
        &self,
        record: RecordId,
        payload: VisualAcuityUpdate,
        user: UserId,
    ) -> Result<Value> {
        for eye in [&payload.od, &payload.os].into_iter().flatten() {
            for value in [&eye.uncorrected, &eye.corrected].into_iter().flatten() {
                validate_visual_acuity(value)?;
            }
        }
        let mut update = GranularUpdate::new(record, &user);
        update.set.insert(
            "examinations.visual_acuity".into(),
            serde_json::to_value(&payload)?,
        );
        self.apply(update, &user, "update_visual_acuity").await
    }

    pub async fn update_anterior_segment(
        &self,
        record: RecordId,
        payload: Value,
        user: UserId,
    ) -> Result<Value> {
        self.update_subtree(record, "examinations.anterior_segment", payload, user, "update_anterior_segment")
            .await
    }

    pub async fn update_posterior_segment(
        &self,
        record: RecordId,
        payload: Value,
        user: UserId,
    ) -> Result<Value> {
        self.update_subtree(record, "examinations.posterior_segment", payload, user, "update_posterior_segment")
            .await
    }

    pub async fn update_keratometry(
        &self,
        record: RecordId,
        payload: Value,
        user: UserId,
    ) -> Result<Value> {
        self.update_subtree(record, "examinations.keratometry", payload, user, "update_keratometry")
            .await
    }

    pub async fn update_pathology_findings(
        &self,
        record: RecordId,
        payload: Value,
        user: UserId,
    ) -> Result<Value> {
        self.update_subtree(record, "pathology_findings", payload, user, "update_pathology_findings")
            .await
    }

    pub async fn update_notes(
        &self,
        record: RecordId,
        payload: Value,
        user: UserId,
    ) -> Result<Value> {
        self.update_subtree(record, "notes", payload, user, "update_notes").await
    }

    pub async fn update_chief_complaint(
        &self,
        record: RecordId,
        payload: Value,
        user: UserId,
    ) -> Result<Value> {
        self.update_subtree(record, "chief_complaint", payload, user, "update_chief_complaint")
            .await
    }

    async fn update_subtree(
        &self,
        record: RecordId,
        path: &str,
        payload: Value,
        user: UserId,
        operation: &str,
    ) -> Result<Value> {
        if payload.is_null() {
            return Err(IntegrationError::validation(path, "payload must not be null"));
        }
        let mut update = GranularUpdate::new(record, &user);
        update.set.insert(path.into(), payload);
        self.apply(update, &user, operation).await
    }

    /// Idempotent add of a prescription reference.
    pub async fn link_prescription(
        &self,
        record: RecordId,
        prescription: RecordId,
        user: UserId,
    ) -> Result<Value> {
        let mut update = GranularUpdate::new(record, &user);
        update
            .add_to_set
            .insert("prescriptions".into(), json!(prescription.as_str()));
        self.apply(update, &user, "link_prescription").await
    }

    /// Idempotent add of an intravitreal-injection reference.
    pub async fn link_ivt(
        &self,
        record: RecordId,
        ivt: RecordId,
        user: UserId,
    ) -> Result<Value> {
        let mut update = GranularUpdate::new(record, &user);
        update.add_to_set.insert("ivt_injections".into(), json!(ivt.as_str()));
        self.apply(update, &user, "link_ivt").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Captures applied updates for inspection.
    #[derive(Default)]
    struct CapturingStore {
        updates: Mutex<Vec<GranularUpdate>>,
    }

    #[async_trait]
    impl RecordPatchStore for CapturingStore {
        async fn apply(&self, update: &GranularUpdate) -> Result<Value> {
            self.updates.lock().unwrap().push(update.clone());
            Ok(json!({"_id": update.record.as_str()}))
        }
    }

    fn fixtures() -> (GranularRecordUpdater, Arc<CapturingStore>) {
        let store = Arc::new(CapturingStore::default());
        (GranularRecordUpdater::new(store.clone()), store)
    }

    fn record() -> RecordId {
        RecordId::from_trusted("record-0000000000001")
    }

    fn user() -> UserId {
        UserId::from_trusted("user-000000000001")
    }

    #[tokio::test]
    async fn refraction_update_touches_only_declared_subtrees() {
        let (updater, store) = fixtures();
        let payload = RefractionUpdate {
            exam: None,
            objective: Some(RefractionSection {
                od: Some(EyeRefraction {
                    sphere: Some(-2.25),
                    cylinder: Some(-0.75),
                    axis: Some(85.0),
                    addition: None,
                }),
                os: None,
            }),
            subjective: None,
            final_prescription: None,
        };
        updater
            .update_refraction(record(), payload, user())
            .await
            .unwrap();

        let updates = store.updates.lock().unwrap();
        let allowed = [
            "updated_by",
            "updated_at",
            "exam",
            "refraction.objective",
            "refraction.subjective",
            "refraction.final_prescription",
        ];
        for field in updates[0].touched_fields() {
            assert!(allowed.contains(&field), "unexpected field {field}");
        }
        assert!(updates[0].set.contains_key("refraction.objective"));
        assert!(!updates[0].set.contains_key("refraction.subjective"));
    }

    #[tokio::test]
    async fn out_of_range_refraction_rejected_before_store() {
        let (updater, store) = fixtures();
        let payload = RefractionUpdate {
            objective: Some(RefractionSection {
                od: Some(EyeRefraction {
                    sphere: Some(-30.0),
                    ..Default::default()
                }),
                os: None,
            }),
            ..Default::default()
        };
        assert!(
            updater
                .update_refraction(record(), payload, user())
                .await
                .is_err()
        );
        assert!(store.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn diagnosis_entries_require_code_and_description() {
        let (updater, _) = fixtures();
        let entries = vec![DiagnosisEntry {
            code: "H40.1".into(),
            description: String::new(),
            laterality: None,
            severity: None,
        }];
        assert!(
            updater
                .update_diagnosis(record(), entries, user())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn iop_range_enforced() {
        let (updater, _) = fixtures();
        let payload = IopUpdate {
            od: Some(72.0),
            ..Default::default()
        };
        assert!(updater.update_iop(record(), payload, user()).await.is_err());

        let payload = IopUpdate {
            od: Some(17.0),
            os: Some(22.0),
            ..Default::default()
        };
        assert!(updater.update_iop(record(), payload, user()).await.is_ok());
    }

    #[tokio::test]
    async fn link_operations_use_add_to_set() {
        let (updater, store) = fixtures();
        updater
            .link_prescription(record(), RecordId::from_trusted("rx-00000000000001"), user())
            .await
            .unwrap();
        let updates = store.updates.lock().unwrap();
        assert!(updates[0].add_to_set.contains_key("prescriptions"));
        // Audit fields still ride along in `set`.
        assert!(updates[0].set.contains_key("updated_by"));
    }
}
