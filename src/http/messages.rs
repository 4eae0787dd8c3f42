use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fanout::SessionEvent;
use crate::session::SessionStatus;

/// Message from a client over the duplex channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    StartRecording {
        session_id: String,
        user_id: String,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AudioChunk {
        session_id: String,
        /// Base64-encoded fragment payload
        audio_data: String,
        mime_type: String,
        /// Normalized RMS amplitude in [0, 1]
        #[serde(default)]
        audio_level: Option<f32>,
        #[serde(default)]
        chunk_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PauseRecording { session_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeRecording {
        session_id: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StopRecording { session_id: String },
    #[serde(rename_all = "camelCase")]
    CancelRecording { session_id: String },
    #[serde(rename_all = "camelCase")]
    JoinSession { session_id: String },
    Pong,
}

/// Chunk payload inside a live transcript update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChunk {
    pub chunk_index: u32,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Message from the server: direct replies and broadcast events share one
/// tagged namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RecordingStarted { session_id: String },
    #[serde(rename_all = "camelCase")]
    ChunkReceived {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RecordingPaused { session_id: String },
    #[serde(rename_all = "camelCase")]
    RecordingResumed { session_id: String },
    #[serde(rename_all = "camelCase")]
    RecordingCompleted {
        session_id: String,
        transcript: String,
        summary: String,
    },
    #[serde(rename_all = "camelCase")]
    RecordingCancelled { session_id: String },
    #[serde(rename_all = "camelCase")]
    LiveTranscriptUpdate {
        session_id: String,
        new_chunk: NewChunk,
    },
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        session_id: String,
        status: SessionStatus,
    },
    Error { message: String },
    Ping,
}

impl ServerMessage {
    pub fn from_event(event: SessionEvent) -> Self {
        match event {
            SessionEvent::TranscriptUpdate {
                session_id,
                chunk_index,
                text,
                timestamp,
            } => ServerMessage::LiveTranscriptUpdate {
                session_id,
                new_chunk: NewChunk {
                    chunk_index,
                    text,
                    timestamp,
                },
            },
            SessionEvent::Status { session_id, status } => {
                ServerMessage::StatusUpdate { session_id, status }
            }
            SessionEvent::Completed {
                session_id,
                transcript,
                summary,
            } => ServerMessage::RecordingCompleted {
                session_id,
                transcript,
                summary,
            },
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"type\":\"error\",\"message\":\"serialization failed: {}\"}}", e)
        })
    }
}
