use homemoney_core::ExpenseDto;
use serde::{Deserialize, Serialize};

/// Failed attempts an outbox entry may accumulate before it is dropped.
pub const MAX_RETRY_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Expense,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Expense => "expense",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "expense" => Some(EntityType::Expense),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "CREATE",
            SyncOperation::Update => "UPDATE",
            SyncOperation::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATE" => Some(SyncOperation::Create),
            "UPDATE" => Some(SyncOperation::Update),
            "DELETE" => Some(SyncOperation::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: i64,
    pub entity_type: EntityType,
    pub local_id: String,
    pub operation: SyncOperation,
    pub payload: String,
    pub retry_count: u32,
    pub created_at: i64,
}

/// Copy of a record taken when its change was queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseSnapshot {
    pub local_id: String,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(rename = "type")]
    pub expense_type: String,
    #[serde(default)]
    pub remark: Option<String>,
    pub amount: f64,
    pub date: String,
}

impl ExpenseSnapshot {
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_dto(&self) -> ExpenseDto {
        ExpenseDto {
            id: None,
            expense_type: self.expense_type.clone(),
            remark: self.remark.clone(),
            amount: self.amount,
            date: self.date.clone(),
        }
    }

    pub fn same_payload_as(&self, remote: &ExpenseDto) -> bool {
        self.expense_type == remote.expense_type
            && self.remark == remote.remark
            && self.amount == remote.amount
            && self.date == remote.date
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_match_stored_values() {
        for op in [
            SyncOperation::Create,
            SyncOperation::Update,
            SyncOperation::Delete,
        ] {
            assert_eq!(SyncOperation::parse(op.as_str()), Some(op));
        }
        assert_eq!(SyncOperation::parse("upsert"), None);
        assert_eq!(EntityType::parse("budget"), None);
    }

    #[test]
    fn snapshot_keeps_remote_id_for_deletes() {
        let snapshot = ExpenseSnapshot {
            local_id: "L1".into(),
            remote_id: Some("R1".into()),
            expense_type: "交通".into(),
            remark: None,
            amount: 4.0,
            date: "2024-02-02".into(),
        };
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"remoteId\":\"R1\""));
        assert!(json.contains("\"type\":\"交通\""));
        assert_eq!(ExpenseSnapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn unreadable_snapshot_is_an_error() {
        assert!(ExpenseSnapshot::from_json("{\"localId\":\"L1\"}").is_err());
        assert!(ExpenseSnapshot::from_json("not json").is_err());
    }

    #[test]
    fn payload_comparison_ignores_ids() {
        let snapshot = ExpenseSnapshot {
            local_id: "L1".into(),
            remote_id: None,
            expense_type: "餐饮".into(),
            remark: Some("noodles".into()),
            amount: 12.5,
            date: "2024-02-02".into(),
        };
        let mut remote = snapshot.to_dto();
        remote.id = Some("99".into());
        assert!(snapshot.same_payload_as(&remote));
        remote.amount = 13.0;
        assert!(!snapshot.same_payload_as(&remote));
    }
}
