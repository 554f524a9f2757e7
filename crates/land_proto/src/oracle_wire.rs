//! JSON shapes exchanged with the decision oracle.

use serde::{Deserialize, Serialize};

pub const SENSE_ROWS: usize = 8;
pub const SENSE_COLS: usize = 8;
/// self, other, obstacle
pub const SENSE_PLANES: usize = 3;

pub type SenseState = [[[f64; SENSE_PLANES]; SENSE_COLS]; SENSE_ROWS];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub instances: Vec<PredictionInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionInstance {
    pub state: SenseState,
    pub key: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

/// Scores ordered as `[none, left, right, up, down]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub q: Vec<f64>,
    #[serde(default)]
    pub key: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_nested_state_arrays() {
        let mut state = [[[0.0; SENSE_PLANES]; SENSE_COLS]; SENSE_ROWS];
        state[4][4][0] = 1.0;
        let request = PredictionRequest {
            instances: vec![PredictionInstance { state, key: 3 }],
        };
        let value = serde_json::to_value(&request).expect("encode");
        let rows = value["instances"][0]["state"].as_array().expect("rows");
        assert_eq!(rows.len(), SENSE_ROWS);
        assert_eq!(rows[0].as_array().expect("cols").len(), SENSE_COLS);
        assert_eq!(value["instances"][0]["state"][4][4][0], serde_json::json!(1.0));
        assert_eq!(value["instances"][0]["key"], serde_json::json!(3));
    }

    #[test]
    fn response_tolerates_missing_key() {
        let response: PredictionResponse =
            serde_json::from_str(r#"{"predictions":[{"q":[0.1,0.9,0.2,0.0,0.0]}]}"#)
                .expect("decode");
        assert_eq!(response.predictions[0].q.len(), 5);
        assert_eq!(response.predictions[0].key, 0);
    }
}
