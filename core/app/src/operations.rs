//! Typed builders for queued terminal operations.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tillsync_store::OperationKind;

/// One line of an order. Amounts are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_id: Option<String>,
    pub quantity: u32,
    pub unit_price: i64,
}

impl OrderLine {
    pub fn total(&self) -> i64 {
        self.unit_price * i64::from(self.quantity)
    }
}

/// A state-changing action, with the payload the backend expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOperation {
    OpenShift { opening_float: i64 },
    CloseShift { counted_cash: i64 },
    OpenTill { amount: i64 },
    CloseTill { amount: i64 },
    CreateOrder { lines: Vec<OrderLine> },
    /// `order_ref` is the server id, or the local id of an order created
    /// offline.
    CloseOrder { order_ref: String, payment_method: String, tendered: i64 },
    VoidOrder { order_ref: String, reason: String },
}

impl TerminalOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            TerminalOperation::OpenShift { .. } => OperationKind::OpenShift,
            TerminalOperation::CloseShift { .. } => OperationKind::CloseShift,
            TerminalOperation::OpenTill { .. } => OperationKind::OpenTill,
            TerminalOperation::CloseTill { .. } => OperationKind::CloseTill,
            TerminalOperation::CreateOrder { .. } => OperationKind::CreateOrder,
            TerminalOperation::CloseOrder { .. } => OperationKind::CloseOrder,
            TerminalOperation::VoidOrder { .. } => OperationKind::VoidOrder,
        }
    }

    /// JSON payload stored with the queued operation.
    pub fn payload(&self) -> Value {
        match self {
            TerminalOperation::OpenShift { opening_float } => {
                json!({ "openingFloat": opening_float })
            }
            TerminalOperation::CloseShift { counted_cash } => json!({ "countedCash": counted_cash }),
            TerminalOperation::OpenTill { amount } | TerminalOperation::CloseTill { amount } => {
                json!({ "amount": amount })
            }
            TerminalOperation::CreateOrder { lines } => json!({
                "lines": lines,
                "total": lines.iter().map(OrderLine::total).sum::<i64>(),
            }),
            TerminalOperation::CloseOrder {
                order_ref,
                payment_method,
                tendered,
            } => json!({
                "orderRef": order_ref,
                "paymentMethod": payment_method,
                "tendered": tendered,
            }),
            TerminalOperation::VoidOrder { order_ref, reason } => json!({
                "orderRef": order_ref,
                "reason": reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_till_payload() {
        let op = TerminalOperation::CloseTill { amount: 500 };
        assert_eq!(op.kind(), OperationKind::CloseTill);
        assert_eq!(op.payload(), json!({"amount": 500}));
    }

    #[test]
    fn test_create_order_totals_lines() {
        let op = TerminalOperation::CreateOrder {
            lines: vec![
                OrderLine {
                    product_id: "p-1".to_string(),
                    size_id: Some("s-1".to_string()),
                    quantity: 2,
                    unit_price: 530,
                },
                OrderLine {
                    product_id: "p-2".to_string(),
                    size_id: None,
                    quantity: 1,
                    unit_price: 300,
                },
            ],
        };

        let payload = op.payload();
        assert_eq!(payload["total"], 1360);
        assert_eq!(payload["lines"][0]["productId"], "p-1");
        assert!(payload["lines"][1].get("sizeId").is_none());
    }
}
