//! One interactive chat against the fleet
//!
//! Each turn resolves a worker through the controller, checks the prompt
//! fits, then streams the reply through a [`StreamDecoder`]. A fresh
//! conversation takes its system message from the worker's template.

use crate::context::precheck;
use crate::controller_client::ControllerClient;
use crate::conversation::Conversation;
use crate::decoder::StreamDecoder;
use crate::worker_client::WorkerClient;
use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_proto::{GenerationRequest, StopStrings, SERVER_ERROR_MSG};
use futures::StreamExt;
use std::io::Write;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct ChatParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_new_tokens: u32,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            max_new_tokens: 512,
        }
    }
}

pub struct ChatSession {
    controller: ControllerClient,
    model: String,
    params: ChatParams,
    conversation: Conversation,
}

impl ChatSession {
    pub fn new(controller: ControllerClient, model: impl Into<String>, params: ChatParams) -> Self {
        Self {
            controller,
            model: model.into(),
            params,
            conversation: Conversation::default(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn reset(&mut self) {
        self.conversation.clear();
    }

    fn request(&self, prompt: String) -> GenerationRequest {
        GenerationRequest {
            model: Some(self.model.clone()),
            temperature: self.params.temperature,
            top_p: self.params.top_p,
            max_new_tokens: self.params.max_new_tokens,
            stop: Some(StopStrings::Many(self.conversation.stop_strings())),
            echo: true,
            ..GenerationRequest::new(prompt)
        }
    }

    /// Send `message`, writing the reply to `out` as it streams in.
    ///
    /// The turn is only recorded in the conversation when the reply
    /// completed without an error frame.
    pub async fn send<W: Write>(&mut self, message: &str, out: &mut W) -> Result<String> {
        let address = self.controller.get_worker_address(&self.model).await?;
        let worker = WorkerClient::new(&address)?;

        if self.conversation.turns() == 0 {
            match worker.conv_template(Some(&self.model)).await {
                Ok(template) => self.conversation = Conversation::from_template(&template),
                Err(e) => warn!("No conversation template from {}: {}", address, e),
            }
        }

        let prompt = self.conversation.prompt_for(message);
        precheck(&worker, Some(&self.model), &prompt, self.params.max_new_tokens).await?;

        let request = self.request(prompt);
        let mut decoder = StreamDecoder::for_prompt(&request.prompt, request.echo);
        let mut frames = worker.generate_stream(&request).await?;
        debug!("Streaming reply from {}", address);

        let mut reply = String::new();
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if let Some(piece) = decoder.push(&frame)? {
                write!(out, "{}", piece)?;
                out.flush()?;
                reply.push_str(&piece);
            }
            if frame.is_terminal() {
                break;
            }
        }
        if let Some(rest) = decoder.finish() {
            write!(out, "{}", rest)?;
            reply.push_str(&rest);
        }
        writeln!(out)?;

        let reply = reply.trim().to_string();
        self.conversation.push_turn(message, reply.clone());
        Ok(reply)
    }
}

/// Text shown to the user when a turn fails
pub fn display_error(err: &ChatFleetError) -> String {
    match err {
        ChatFleetError::NoWorkerAvailable(_) => SERVER_ERROR_MSG.to_string(),
        ChatFleetError::Generation { code, text } => format!("{} (error_code: {})", text, code),
        ChatFleetError::ContextOverflow(msg) => {
            format!("{} (error_code: {})", msg, err.error_code().as_i32())
        }
        other => format!(
            "{} (error_code: {}, {})",
            SERVER_ERROR_MSG,
            other.error_code().as_i32(),
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatfleet_common::config::{BackendConfig, ControllerConfig, MockModelConfig, WorkerConfig};
    use chatfleet_controller::{Controller, HttpStatusProbe};
    use chatfleet_proto::ErrorCode;
    use chatfleet_worker::{build_backend, ModelWorker};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn worker_config(address: &str, reply: &str, context_length: usize) -> WorkerConfig {
        worker_config_with_template(address, reply, context_length, None)
    }

    fn worker_config_with_template(
        address: &str,
        reply: &str,
        context_length: usize,
        conv_template: Option<serde_json::Value>,
    ) -> WorkerConfig {
        WorkerConfig {
            worker_address: address.to_string(),
            controller_address: "http://127.0.0.1:9".to_string(),
            model_names: vec!["vicuna-7b".to_string()],
            limit_worker_concurrency: 2,
            no_register: true,
            heart_beat_interval_secs: 45,
            controller_timeout_secs: 5,
            max_queue_wait_ms: None,
            speed: 1.0,
            conv_template,
            backend: BackendConfig::Local {
                model: MockModelConfig {
                    context_length,
                    reply: Some(reply.to_string()),
                    step_delay_ms: 0,
                },
            },
        }
    }

    /// Real worker and controller on ephemeral ports; returns the controller URL
    async fn start_fleet(reply: &str, context_length: usize) -> String {
        start_fleet_with_template(reply, context_length, None).await
    }

    async fn start_fleet_with_template(
        reply: &str,
        context_length: usize,
        conv_template: Option<serde_json::Value>,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker_address = format!("http://{}", listener.local_addr().unwrap());
        let config = worker_config_with_template(&worker_address, reply, context_length, conv_template);
        let worker = Arc::new(ModelWorker::new(&config, build_backend(&config.backend).unwrap()));
        let router = chatfleet_worker::create_router(worker);
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let probe = Arc::new(HttpStatusProbe::new(Duration::from_secs(5)).unwrap());
        let controller = Arc::new(Controller::new(ControllerConfig::default(), probe));
        controller.register_worker(&worker_address, false, None).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let controller_address = format!("http://{}", listener.local_addr().unwrap());
        let router = chatfleet_controller::create_router(controller);
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        controller_address
    }

    fn session(controller_address: &str, model: &str, max_new_tokens: u32) -> ChatSession {
        let params = ChatParams {
            max_new_tokens,
            ..Default::default()
        };
        ChatSession::new(ControllerClient::new(controller_address).unwrap(), model, params)
    }

    #[tokio::test]
    async fn test_reply_streams_without_echo() {
        let controller = start_fleet("Hello there!", 2048).await;
        let mut chat = session(&controller, "vicuna-7b", 64);
        let mut out = Vec::new();

        let reply = chat.send("hi", &mut out).await.unwrap();

        assert_eq!(reply, "Hello there!");
        assert_eq!(String::from_utf8(out).unwrap(), "Hello there!\n");
        assert_eq!(chat.conversation().turns(), 1);
    }

    #[tokio::test]
    async fn test_worker_template_sets_system_message() {
        let template = serde_json::json!({"name": "vicuna_v1.1", "system_message": "Be brief."});
        let controller = start_fleet_with_template("ok", 2048, Some(template)).await;
        let mut chat = session(&controller, "vicuna-7b", 16);

        chat.send("hi", &mut Vec::new()).await.unwrap();

        assert_eq!(
            chat.conversation().prompt_for("again"),
            "Be brief. USER: hi ASSISTANT: ok</s>USER: again ASSISTANT:"
        );
    }

    #[tokio::test]
    async fn test_stop_string_cuts_reply() {
        let controller = start_fleet("Sure.</s>USER: more", 2048).await;
        let mut chat = session(&controller, "vicuna-7b", 64);
        let mut out = Vec::new();

        let reply = chat.send("hi", &mut out).await.unwrap();

        assert_eq!(reply, "Sure.");
    }

    #[tokio::test]
    async fn test_unknown_model_shows_server_error() {
        let controller = start_fleet("x", 2048).await;
        let mut chat = session(&controller, "gpt-4", 64);

        let err = chat.send("hi", &mut Vec::new()).await.unwrap_err();

        assert_eq!(err.error_code(), ErrorCode::ControllerNoWorker);
        assert_eq!(display_error(&err), SERVER_ERROR_MSG);
        assert_eq!(chat.conversation().turns(), 0);
    }

    #[tokio::test]
    async fn test_context_overflow_is_caught_before_generation() {
        let controller = start_fleet("x", 256).await;
        let mut chat = session(&controller, "vicuna-7b", 200);

        let err = chat.send("hi", &mut Vec::new()).await.unwrap_err();

        assert!(matches!(err, ChatFleetError::ContextOverflow(_)));
        assert!(display_error(&err).ends_with("(error_code: 40303)"));
    }

    #[test]
    fn test_error_frame_display() {
        let err = ChatFleetError::Generation {
            code: 50001,
            text: format!("{}\n\n(boom)", SERVER_ERROR_MSG),
        };

        assert_eq!(
            display_error(&err),
            format!("{}\n\n(boom) (error_code: 50001)", SERVER_ERROR_MSG)
        );
    }
}
