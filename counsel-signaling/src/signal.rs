use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Network path descriptor in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    EndCall,
    Busy,
    MissedCall,
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice-candidate",
            Signal::EndCall => "end-call",
            Signal::Busy => "busy",
            Signal::MissedCall => "missed-call",
        }
    }
}

/// A signal in transit. `from` is always the authenticated sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: Uuid,
    pub to: Uuid,
    pub signal: Signal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_wire_format() {
        let offer = serde_json::to_value(Signal::Offer { sdp: "v=0".to_string() }).unwrap();
        assert_eq!(offer, json!({"type": "offer", "sdp": "v=0"}));

        let end = serde_json::to_value(Signal::EndCall).unwrap();
        assert_eq!(end, json!({"type": "end-call"}));

        let ice: Signal = serde_json::from_value(json!({
            "type": "ice-candidate",
            "candidate": {"candidate": "candidate:1 1 udp", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .unwrap();
        assert_eq!(
            ice,
            Signal::IceCandidate {
                candidate: IceCandidate {
                    candidate: "candidate:1 1 udp".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                }
            }
        );
    }

    #[test]
    fn test_unknown_signal_type_is_rejected() {
        let parsed = serde_json::from_value::<Signal>(json!({"type": "hold"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_kind_matches_tag() {
        for signal in [
            Signal::Answer { sdp: String::new() },
            Signal::IceCandidate { candidate: IceCandidate::new("c") },
            Signal::Busy,
            Signal::MissedCall,
        ] {
            let value = serde_json::to_value(&signal).unwrap();
            assert_eq!(value["type"], signal.kind());
        }
    }
}
