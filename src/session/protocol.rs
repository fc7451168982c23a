//! Wire messages of the Gemini Live `BidiGenerateContent` WebSocket.
//!
//! Only the fields the bridge uses are modelled; unknown fields are ignored.

use crate::config::SessionConfig;
use crate::session::{EncodedAudio, SessionEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub input_audio_transcription: Empty,
    pub output_audio_transcription: Empty,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Serializes as `{}`; presence of the key is what enables the feature.
#[derive(Debug, Default, Serialize)]
pub struct Empty {}

impl SetupMessage {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            setup: Setup {
                model: config.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: config.system_instruction.clone(),
                    }],
                },
                input_audio_transcription: Empty::default(),
                output_audio_transcription: Empty::default(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

impl From<EncodedAudio> for RealtimeInputMessage {
    fn from(audio: EncodedAudio) -> Self {
        Self {
            realtime_input: RealtimeInput {
                audio: Blob {
                    mime_type: audio.mime_type,
                    data: audio.data,
                },
            },
        }
    }
}

/// Any message the server may send. Exactly one of the fields is normally set.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<Blob>,
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

impl ServerContent {
    /// Flatten one server message into bridge events.
    ///
    /// Order: input transcript, output transcript, turn-complete, audio, interruption.
    pub fn into_events(self) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        if let Some(t) = self.input_transcription {
            events.push(SessionEvent::InputTranscription(t.text));
        }
        if let Some(t) = self.output_transcription {
            events.push(SessionEvent::OutputTranscription(t.text));
        }
        if self.turn_complete {
            events.push(SessionEvent::TurnComplete);
        }
        if let Some(turn) = self.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    if !blob.data.is_empty() {
                        events.push(SessionEvent::Audio(blob.data));
                    }
                }
            }
        }
        if self.interrupted {
            events.push(SessionEvent::Interrupted);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_message_shape() {
        let config = crate::config::AppConfig::default().session;
        let json = serde_json::to_value(SetupMessage::from_config(&config)).unwrap();

        assert_eq!(json["setup"]["model"], config.model.as_str());
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert!(json["setup"]["inputAudioTranscription"].is_object());
        assert!(json["setup"]["outputAudioTranscription"].is_object());
    }

    #[test]
    fn test_realtime_input_shape() {
        let msg: RealtimeInputMessage = EncodedAudio {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        }
        .into();
        let json = serde_json::to_value(msg).unwrap();
        assert_eq!(json["realtimeInput"]["audio"]["data"], "AAAA");
        assert_eq!(json["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
    }

    #[test]
    fn test_server_content_event_order() {
        let raw = r#"{
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQI="}}]},
                "turnComplete": true,
                "outputTranscription": {"text": "hi"},
                "inputTranscription": {"text": "hello"}
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let events = msg.server_content.unwrap().into_events();

        assert_eq!(
            events,
            vec![
                SessionEvent::InputTranscription("hello".to_string()),
                SessionEvent::OutputTranscription("hi".to_string()),
                SessionEvent::TurnComplete,
                SessionEvent::Audio("AQI=".to_string()),
                SessionEvent::Interrupted,
            ]
        );
    }

    #[test]
    fn test_setup_complete_and_unknown_fields() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}, "usageMetadata": {"x": 1}}"#).unwrap();
        assert!(msg.setup_complete.is_some());
        assert!(msg.server_content.is_none());
    }
}
