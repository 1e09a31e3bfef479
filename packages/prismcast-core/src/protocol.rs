//! Client/server control messages.
//!
//! Every control message is a JSON object framed as a 2-byte big-endian
//! length followed by that many bytes of JSON, carried inside a single
//! WebSocket Binary frame. Media bytes travel as separate Binary frames.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("control message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("length prefix disagrees with payload size")]
    BadLengthPrefix,

    #[error("control message exceeds the 16-bit length prefix")]
    TooLong,
}

/// Player events reported in `client-info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientEvent {
    /// Periodic report, roughly 4 Hz.
    Timer,
    /// Playback started for the first time after init.
    Startup,
    /// Playback stalled on an empty buffer.
    Rebuffer,
    /// Playback resumed after a stall.
    Play,
}

/// Fields shared by video and audio acks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckCommon {
    pub init_id: u32,
    pub channel: String,
    pub format: String,
    pub timestamp: u64,
    pub byte_offset: u64,
    pub byte_length: u64,
    pub total_byte_length: u64,
    pub video_buffer: f64,
    pub audio_buffer: f64,
    pub cum_rebuffer: f64,
}

impl AckCommon {
    /// True once the last piece of the chunk has arrived client-side.
    pub fn is_final_piece(&self) -> bool {
        self.byte_offset + self.byte_length == self.total_byte_length
    }
}

/// Messages the player sends us.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "client-init", rename_all = "camelCase")]
    Init {
        init_id: u32,
        channel: String,
        #[serde(default)]
        session_key: String,
        #[serde(default)]
        user_name: String,
        #[serde(default)]
        os: String,
        #[serde(default)]
        browser: String,
        screen_width: u16,
        screen_height: u16,
        #[serde(default)]
        next_vts: Option<u64>,
        #[serde(default)]
        next_ats: Option<u64>,
    },

    #[serde(rename = "client-info", rename_all = "camelCase")]
    Info {
        init_id: u32,
        event: ClientEvent,
        video_buffer: f64,
        audio_buffer: f64,
        cum_rebuffer: f64,
        #[serde(default)]
        screen_width: Option<u16>,
        #[serde(default)]
        screen_height: Option<u16>,
    },

    #[serde(rename = "client-vidack")]
    VideoAck {
        #[serde(flatten)]
        ack: AckCommon,
        ssim: f64,
    },

    #[serde(rename = "client-audack")]
    AudioAck {
        #[serde(flatten)]
        ack: AckCommon,
    },
}

/// Error kinds carried by `server-error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerErrorKind {
    /// The server is shutting down; reconnect later.
    Maintenance,
    /// The session cannot continue (unknown channel, evicted resume point,
    /// algorithm failure); the client should re-init.
    Reinit,
}

/// Messages we send the player.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "server-hello", rename_all = "camelCase")]
    Hello { channels: Vec<String> },

    #[serde(rename = "server-init", rename_all = "camelCase")]
    Init {
        channel: String,
        video_codec: String,
        audio_codec: String,
        timescale: u32,
        init_video_timestamp: u64,
        init_audio_timestamp: u64,
        init_id: u32,
        can_resume: bool,
    },

    #[serde(rename = "server-video", rename_all = "camelCase")]
    Video {
        channel: String,
        quality: String,
        ssim: f64,
        timestamp: u64,
        duration: u32,
        byte_offset: u64,
        byte_length: u64,
        total_byte_length: u64,
    },

    #[serde(rename = "server-audio", rename_all = "camelCase")]
    Audio {
        channel: String,
        quality: String,
        timestamp: u64,
        duration: u32,
        byte_offset: u64,
        byte_length: u64,
        total_byte_length: u64,
    },

    #[serde(rename = "server-error", rename_all = "camelCase")]
    Error {
        init_id: u32,
        error: ServerErrorKind,
    },
}

/// Serializes a control message with its 2-byte big-endian length prefix.
pub fn pack(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
    let json = serde_json::to_vec(msg)?;
    let len = u16::try_from(json.len()).map_err(|_| ProtocolError::TooLong)?;

    let mut out = BytesMut::with_capacity(2 + json.len());
    out.put_u16(len);
    out.put_slice(&json);
    Ok(out.freeze())
}

/// Parses a length-prefixed client control message out of one Binary frame
/// payload. The prefix must account for exactly the remaining bytes.
pub fn unpack(payload: &[u8]) -> Result<ClientMessage, ProtocolError> {
    if payload.len() < 2 {
        return Err(ProtocolError::BadLengthPrefix);
    }
    let declared = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
    let json = &payload[2..];
    if declared != json.len() {
        return Err(ProtocolError::BadLengthPrefix);
    }
    Ok(serde_json::from_slice(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(json: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(json.len() as u16).to_be_bytes());
        out.extend_from_slice(json.as_bytes());
        out
    }

    #[test]
    fn unpacks_client_init() {
        let json = r#"{"type":"client-init","initId":3,"channel":"abc",
            "sessionKey":"k","userName":"u","os":"linux","browser":"firefox",
            "screenWidth":1920,"screenHeight":1080,"nextVts":360360}"#;
        let msg = unpack(&framed(json)).unwrap();
        match msg {
            ClientMessage::Init {
                init_id,
                channel,
                next_vts,
                next_ats,
                screen_width,
                ..
            } => {
                assert_eq!(init_id, 3);
                assert_eq!(channel, "abc");
                assert_eq!(next_vts, Some(360360));
                assert_eq!(next_ats, None);
                assert_eq!(screen_width, 1920);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unpacks_client_info_events() {
        for (name, event) in [
            ("timer", ClientEvent::Timer),
            ("startup", ClientEvent::Startup),
            ("rebuffer", ClientEvent::Rebuffer),
            ("play", ClientEvent::Play),
        ] {
            let json = format!(
                r#"{{"type":"client-info","initId":1,"event":"{name}",
                    "videoBuffer":4.5,"audioBuffer":5.0,"cumRebuffer":0.25}}"#
            );
            match unpack(&framed(&json)).unwrap() {
                ClientMessage::Info { event: e, video_buffer, .. } => {
                    assert_eq!(e, event);
                    assert!((video_buffer - 4.5).abs() < 1e-9);
                }
                other => panic!("wrong variant: {other:?}"),
            }
        }
    }

    #[test]
    fn unpacks_video_ack_with_ssim() {
        let json = r#"{"type":"client-vidack","initId":1,"channel":"abc",
            "format":"1280x720-23","timestamp":360360,"byteOffset":1048576,
            "byteLength":1000,"totalByteLength":1049576,"videoBuffer":7.0,
            "audioBuffer":7.5,"cumRebuffer":0.0,"ssim":0.971}"#;
        match unpack(&framed(json)).unwrap() {
            ClientMessage::VideoAck { ack, ssim } => {
                assert_eq!(ack.timestamp, 360360);
                assert!(ack.is_final_piece());
                assert!((ssim - 0.971).abs() < 1e-9);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type_and_bad_prefix() {
        assert!(matches!(
            unpack(&framed(r#"{"type":"client-mystery"}"#)),
            Err(ProtocolError::Json(_))
        ));

        let mut bad = framed(r#"{"type":"client-init"}"#);
        bad[1] += 1; // prefix no longer matches
        assert!(matches!(unpack(&bad), Err(ProtocolError::BadLengthPrefix)));

        assert!(matches!(unpack(&[7]), Err(ProtocolError::BadLengthPrefix)));
    }

    #[test]
    fn pack_prefixes_big_endian_length() {
        let packed = pack(&ServerMessage::Hello {
            channels: vec!["abc".to_string()],
        })
        .unwrap();
        let declared = usize::from(u16::from_be_bytes([packed[0], packed[1]]));
        assert_eq!(declared, packed.len() - 2);

        let value: serde_json::Value = serde_json::from_slice(&packed[2..]).unwrap();
        assert_eq!(value["type"], "server-hello");
        assert_eq!(value["channels"][0], "abc");
    }

    #[test]
    fn server_init_serializes_camel_case() {
        let packed = pack(&ServerMessage::Init {
            channel: "abc".to_string(),
            video_codec: "avc1".to_string(),
            audio_codec: "opus".to_string(),
            timescale: 90000,
            init_video_timestamp: 360360,
            init_audio_timestamp: 0,
            init_id: 9,
            can_resume: true,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&packed[2..]).unwrap();
        assert_eq!(value["type"], "server-init");
        assert_eq!(value["initVideoTimestamp"], 360360);
        assert_eq!(value["canResume"], true);
        assert_eq!(value["initId"], 9);
    }

    #[test]
    fn server_error_kind_names() {
        let packed = pack(&ServerMessage::Error {
            init_id: 0,
            error: ServerErrorKind::Maintenance,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&packed[2..]).unwrap();
        assert_eq!(value["error"], "maintenance");
    }
}
