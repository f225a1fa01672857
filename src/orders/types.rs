//! Print-mail order types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::model::OrderMode;

/// The credential/mode actually used for orders after any force-test override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveMode {
    pub mode: OrderMode,
    /// Force-test override was switched on.
    pub forced_test_mode: bool,
}

impl EffectiveMode {
    /// Test if forced or if test was configured; live otherwise.
    pub fn resolve(configured: OrderMode, force_test_mode: bool) -> Self {
        let mode = if force_test_mode || configured == OrderMode::Test {
            OrderMode::Test
        } else {
            OrderMode::Live
        };
        Self {
            mode,
            forced_test_mode: force_test_mode,
        }
    }

    /// Whether the override changed what the operator configured.
    pub fn overrides(&self, configured: OrderMode) -> bool {
        self.forced_test_mode && configured == OrderMode::Live
    }
}

/// Provider response for a created postcard, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: String,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub to: Option<Value>,
    #[serde(default)]
    pub from: Option<Value>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(default)]
    pub send_date: Option<String>,
    #[serde(default)]
    pub expected_delivery_date: Option<String>,
    /// Any fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub order_id: String,
    pub status: Option<String>,
    pub effective: EffectiveMode,
    pub response: OrderResponse,
}
