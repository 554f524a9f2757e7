//! Decision oracle client: submits a sensory grid, decodes one action.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use land_proto::{PredictionInstance, PredictionRequest, PredictionResponse};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sensory::SensoryGrid;

/// Step reported for every moving action.
pub const STEP_SPEED: f64 = 4.0;

const SCORE_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Facing {
    Up,
    Right,
    Down,
    Left,
}

impl Facing {
    pub fn degrees(self) -> f64 {
        match self {
            Facing::Up => 0.0,
            Facing::Right => 90.0,
            Facing::Down => 180.0,
            Facing::Left => 270.0,
        }
    }
}

/// Declaration order is the tie-break order: an earlier action wins equal
/// scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    None,
    Left,
    Right,
    Up,
    Down,
}

impl Action {
    pub const ALL: [Action; SCORE_COUNT] = [
        Action::None,
        Action::Left,
        Action::Right,
        Action::Up,
        Action::Down,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Left => "left",
            Action::Right => "right",
            Action::Up => "up",
            Action::Down => "down",
        }
    }

    /// Unit vector in screen coordinates (`y` grows downward).
    pub fn direction(self) -> (f64, f64) {
        match self {
            Action::None => (0.0, 0.0),
            Action::Left => (-1.0, 0.0),
            Action::Right => (1.0, 0.0),
            Action::Up => (0.0, -1.0),
            Action::Down => (0.0, 1.0),
        }
    }

    pub fn facing(self) -> Facing {
        match self {
            Action::None | Action::Down => Facing::Down,
            Action::Left => Facing::Left,
            Action::Right => Facing::Right,
            Action::Up => Facing::Up,
        }
    }

    pub fn decision(self) -> Decision {
        let (dx, dy) = self.direction();
        let is_moving = self != Action::None;
        Decision {
            action: self,
            dx,
            dy,
            facing: self.facing(),
            is_moving,
            speed: if is_moving { STEP_SPEED } else { 0.0 },
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub dx: f64,
    pub dy: f64,
    pub facing: Facing,
    pub is_moving: bool,
    pub speed: f64,
}

/// Picks the strict maximum of `[none, left, right, up, down]`, resolving
/// ties in that order.
pub fn decode_decision(scores: &[f64]) -> Result<Decision, OracleError> {
    if scores.len() != SCORE_COUNT {
        return Err(OracleError::MalformedScores {
            message: format!("expected {SCORE_COUNT} scores, got {}", scores.len()),
        });
    }
    if let Some(index) = scores.iter().position(|score| !score.is_finite()) {
        return Err(OracleError::MalformedScores {
            message: format!("score {index} is not finite"),
        });
    }
    let mut best = 0;
    for (index, score) in scores.iter().enumerate().skip(1) {
        if *score > scores[best] {
            best = index;
        }
    }
    Ok(Action::ALL[best].decision())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    BuildClient { message: String },
    Http { message: String },
    HttpStatus { code: u16, message: String },
    DecodeResponse { message: String },
    EmptyPrediction,
    MalformedScores { message: String },
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::BuildClient { message } => write!(f, "client build failed: {message}"),
            OracleError::Http { message } => write!(f, "http request failed: {message}"),
            OracleError::HttpStatus { code, message } => {
                write!(f, "http status {code}: {message}")
            }
            OracleError::DecodeResponse { message } => {
                write!(f, "decode response failed: {message}")
            }
            OracleError::EmptyPrediction => f.write_str("response carried no prediction"),
            OracleError::MalformedScores { message } => write!(f, "malformed scores: {message}"),
        }
    }
}

impl Error for OracleError {}

pub trait DecisionOracle: Send + Sync {
    fn predict(&self, grid: &SensoryGrid) -> Result<Decision, OracleError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}

#[derive(Debug)]
pub struct HttpDecisionOracle {
    endpoint: String,
    client: Client,
    next_key: AtomicI64,
}

impl HttpDecisionOracle {
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|err| OracleError::BuildClient {
                message: err.to_string(),
            })?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            client,
            next_key: AtomicI64::new(0),
        })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }
}

impl DecisionOracle for HttpDecisionOracle {
    fn predict(&self, grid: &SensoryGrid) -> Result<Decision, OracleError> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let payload = PredictionRequest {
            instances: vec![PredictionInstance {
                state: grid.to_state(),
                key,
            }],
        };

        let response = self
            .client
            .post(self.endpoint.as_str())
            .json(&payload)
            .send()
            .map_err(|err| OracleError::Http {
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_else(|_| "<no body>".to_string());
            return Err(OracleError::HttpStatus {
                code: status.as_u16(),
                message,
            });
        }

        let response: PredictionResponse =
            response
                .json()
                .map_err(|err| OracleError::DecodeResponse {
                    message: err.to_string(),
                })?;
        let first = response
            .predictions
            .into_iter()
            .next()
            .ok_or(OracleError::EmptyPrediction)?;
        if first.key != key {
            debug!(sent = key, received = first.key, "oracle answered with another key");
        }
        decode_decision(&first.q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Serves a single canned response and hands back the raw request.
    fn serve_once(status_line: &str, body: &str, delay: Duration) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let (request_tx, request_rx) = mpsc::channel();
        thread::spawn(move || {
            if let Some(Ok(mut stream)) = listener.incoming().next() {
                let mut request = Vec::new();
                let mut buf = [0_u8; 4096];
                loop {
                    let read = stream.read(&mut buf).unwrap_or(0);
                    request.extend_from_slice(&buf[..read]);
                    if read == 0 || request_is_complete(&request) {
                        break;
                    }
                }
                let _ = request_tx.send(String::from_utf8_lossy(&request).to_string());
                thread::sleep(delay);
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });
        (format!("http://{addr}/dqn"), request_rx)
    }

    fn request_is_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    fn oracle(endpoint: String, timeout_ms: u64) -> HttpDecisionOracle {
        HttpDecisionOracle::from_config(&OracleConfig {
            endpoint,
            timeout_ms,
        })
        .expect("oracle")
    }

    #[test]
    fn decode_picks_strict_maximum() {
        let decision = decode_decision(&[0.1, 0.9, 0.2, 0.0, 0.0]).expect("decode");
        assert_eq!(decision.action, Action::Left);
        assert_eq!((decision.dx, decision.dy), (-1.0, 0.0));
        assert_eq!(decision.facing, Facing::Left);
        assert_eq!(decision.facing.degrees(), 270.0);
        assert!(decision.is_moving);
        assert_eq!(decision.speed, STEP_SPEED);
    }

    #[test]
    fn decode_ties_follow_declaration_order() {
        let none = decode_decision(&[0.5; 5]).expect("all equal");
        assert_eq!(none.action, Action::None);
        assert_eq!((none.dx, none.dy), (0.0, 0.0));
        assert!(!none.is_moving);
        assert_eq!(none.speed, 0.0);

        assert_eq!(
            decode_decision(&[0.0, 0.3, 0.3, 0.0, 0.0]).expect("left/right").action,
            Action::Left
        );
        assert_eq!(
            decode_decision(&[0.0, 0.0, 0.1, 0.7, 0.7]).expect("up/down").action,
            Action::Up
        );
        assert_eq!(
            decode_decision(&[-1.0, -2.0, -3.0, -4.0, 0.0]).expect("down").action,
            Action::Down
        );
    }

    #[test]
    fn directions_follow_screen_coordinates() {
        assert_eq!(Action::Right.decision().facing.degrees(), 90.0);
        assert_eq!(Action::Up.direction(), (0.0, -1.0));
        assert_eq!(Action::Up.facing().degrees(), 0.0);
        assert_eq!(Action::Down.direction(), (0.0, 1.0));
        assert_eq!(Action::Down.facing().degrees(), 180.0);
    }

    #[test]
    fn decode_rejects_wrong_arity_and_nan() {
        assert!(matches!(
            decode_decision(&[0.1, 0.2]),
            Err(OracleError::MalformedScores { .. })
        ));
        assert!(matches!(
            decode_decision(&[0.1, f64::NAN, 0.0, 0.0, 0.0]),
            Err(OracleError::MalformedScores { .. })
        ));
    }

    #[test]
    fn http_oracle_posts_grid_and_decodes_first_prediction() {
        let (endpoint, request_rx) = serve_once(
            "200 OK",
            r#"{"predictions":[{"q":[0.0,0.0,0.8,0.1,0.1],"key":0},{"q":[1,0,0,0,0],"key":1}]}"#,
            Duration::ZERO,
        );
        let mut grid = SensoryGrid::empty();
        grid.set(4, 4, crate::sensory::SELF_PLANE);

        let decision = oracle(endpoint, 2_000).predict(&grid).expect("predict");
        assert_eq!(decision.action, Action::Right);

        let request = request_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("request");
        assert!(request.starts_with("POST /dqn"));
        let body = request.split_once("\r\n\r\n").expect("body").1;
        let payload: PredictionRequest = serde_json::from_str(body).expect("payload");
        assert_eq!(payload.instances.len(), 1);
        assert_eq!(payload.instances[0].key, 0);
        assert_eq!(payload.instances[0].state[4][4], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn http_oracle_reports_non_success_status() {
        let (endpoint, _rx) = serve_once("503 Service Unavailable", r#"{"error":"warming"}"#, Duration::ZERO);
        let err = oracle(endpoint, 2_000)
            .predict(&SensoryGrid::empty())
            .expect_err("status");
        assert!(matches!(err, OracleError::HttpStatus { code: 503, .. }));
    }

    #[test]
    fn http_oracle_reports_malformed_body() {
        let (endpoint, _rx) = serve_once("200 OK", "not json", Duration::ZERO);
        let err = oracle(endpoint, 2_000)
            .predict(&SensoryGrid::empty())
            .expect_err("decode");
        assert!(matches!(err, OracleError::DecodeResponse { .. }));
    }

    #[test]
    fn http_oracle_reports_empty_predictions() {
        let (endpoint, _rx) = serve_once("200 OK", r#"{"predictions":[]}"#, Duration::ZERO);
        let err = oracle(endpoint, 2_000)
            .predict(&SensoryGrid::empty())
            .expect_err("empty");
        assert_eq!(err, OracleError::EmptyPrediction);
    }

    #[test]
    fn http_oracle_times_out_slow_responses() {
        let (endpoint, _rx) = serve_once(
            "200 OK",
            r#"{"predictions":[{"q":[1,0,0,0,0],"key":0}]}"#,
            Duration::from_millis(500),
        );
        let err = oracle(endpoint, 50)
            .predict(&SensoryGrid::empty())
            .expect_err("timeout");
        assert!(matches!(err, OracleError::Http { .. }));
    }

    #[test]
    fn http_oracle_reports_transport_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let err = oracle(format!("http://{addr}/dqn"), 500)
            .predict(&SensoryGrid::empty())
            .expect_err("refused");
        assert!(matches!(err, OracleError::Http { .. }));
    }
}
