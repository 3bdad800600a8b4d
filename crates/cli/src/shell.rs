use std::fmt::Display;
use std::io::Write;
use std::sync::Arc;

use kindle_chat::{
    ChatStream, ChatStreamEvent, ChatStreamPayload, ConversationController, Message,
    ModelComparison, RecentModels, StreamTarget, insufficient_models_message,
};
use kindle_chat::compare::{format_context_length, format_cost};
use kindle_llm::{ModelCatalog, ModelInfo, NetworkMetrics, Role};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{AppResult, ReadInputSnafu, SettingsSnafu, WriteOutputSnafu};
use crate::settings::SettingsStore;

const HELP: &str = "\
Commands:
  /models            list available models
  /model <id|index>  select a model (saved as the default)
  /cancel            stop the streaming reply (Ctrl-C also works)
  /metrics           show network stats for the last request
  /compare           compare the last two models used
  /clear             clear the conversation
  /history           show the conversation
  /quit              exit
Anything else is sent to the selected model.";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Models,
    Model(String),
    Cancel,
    Metrics,
    Compare,
    Clear,
    History,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    /// Parses one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Send(line.to_string()));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        Some(match name {
            "models" => Self::Models,
            "model" if argument.is_empty() => Self::Models,
            "model" => Self::Model(argument.to_string()),
            "cancel" | "stop" => Self::Cancel,
            "metrics" | "stats" => Self::Metrics,
            "compare" => Self::Compare,
            "clear" => Self::Clear,
            "history" => Self::History,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Finds a model by 1-based list position or by exact id.
pub fn resolve_model<'a>(models: &'a [ModelInfo], selector: &str) -> Option<&'a ModelInfo> {
    let selector = selector.trim();
    if let Ok(position) = selector.parse::<usize>() {
        return position.checked_sub(1).and_then(|index| models.get(index));
    }
    models.iter().find(|model| model.id == selector)
}

fn format_duration(millis: Option<f64>) -> String {
    match millis {
        Some(millis) if millis > 0.0 && millis < 1000.0 => format!("{}ms", millis.round()),
        Some(millis) if millis > 0.0 => format!("{:.1}s", millis / 1000.0),
        _ => "N/A".to_string(),
    }
}

fn format_tokens_per_second(rate: Option<f64>) -> String {
    match rate {
        Some(rate) if rate > 0.0 => format!("{} tok/s", rate.round()),
        _ => "N/A".to_string(),
    }
}

fn format_total_tokens(total: Option<u64>) -> String {
    total
        .filter(|total| *total > 0)
        .map_or_else(|| "N/A".to_string(), |total| total.to_string())
}

pub fn format_metrics(metrics: &NetworkMetrics) -> String {
    format!(
        "Time to first token: {}\nTokens per second:   {}\nRequest duration:    {}\nTotal tokens:        {}",
        format_duration(metrics.time_to_first_token),
        format_tokens_per_second(metrics.tokens_per_second),
        format_duration(metrics.request_duration),
        format_total_tokens(metrics.total_tokens),
    )
}

/// One-line summary printed after each reply.
pub fn format_metrics_inline(metrics: &NetworkMetrics) -> String {
    format!(
        "[first token {} | {} | {} | {} tokens]",
        format_duration(metrics.time_to_first_token),
        format_tokens_per_second(metrics.tokens_per_second),
        format_duration(metrics.request_duration),
        format_total_tokens(metrics.total_tokens),
    )
}

/// Renders the conversation, marking every point where the user switched models.
pub fn format_history(messages: &[Message]) -> String {
    if messages.is_empty() {
        return "(no messages yet)".to_string();
    }

    let mut lines = Vec::with_capacity(messages.len());
    let mut previous_model: Option<&str> = None;
    for message in messages {
        if message.role == Role::User {
            let model = message.model_id.as_deref();
            if previous_model.is_some() && model.is_some() && model != previous_model {
                lines.push(format!("--- switched to {} ---", model.unwrap_or_default()));
            }
            previous_model = model.or(previous_model);
        }

        let speaker = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        lines.push(format!("{speaker}: {}", message.content));
    }
    lines.join("\n")
}

async fn next_stream_event(active: &mut Option<ChatStream>) -> Option<ChatStreamEvent> {
    match active {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

/// Interactive line-oriented front end for the conversation controller.
pub struct Shell<W: Write> {
    controller: ConversationController,
    catalog: ModelCatalog,
    recent: Arc<RecentModels>,
    settings: Arc<SettingsStore>,
    selected_model: Option<String>,
    out: W,
}

impl<W: Write> Shell<W> {
    pub fn new(
        controller: ConversationController,
        catalog: ModelCatalog,
        recent: Arc<RecentModels>,
        settings: Arc<SettingsStore>,
        selected_model: Option<String>,
        out: W,
    ) -> Self {
        Self {
            controller,
            catalog,
            recent,
            settings,
            selected_model,
            out,
        }
    }

    pub fn selected_model(&self) -> Option<&str> {
        self.selected_model.as_deref()
    }

    pub fn controller(&self) -> &ConversationController {
        &self.controller
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Reads stdin until `/quit`, end of input, or Ctrl-C while idle.
    ///
    /// Stdin keeps being read while a reply streams so `/cancel` is honored.
    pub async fn run(mut self) -> AppResult<()> {
        self.print_banner()?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut active: Option<ChatStream> = None;

        loop {
            tokio::select! {
                event = next_stream_event(&mut active) => match event {
                    Some(event) => {
                        if self.on_stream_event(event)? {
                            active = None;
                        }
                    }
                    None => {
                        if let Some(stream) = active.take() {
                            self.on_stream_closed(stream.target())?;
                        }
                    }
                },
                line = lines.next_line() => {
                    let line = line.context(ReadInputSnafu { stage: "read-stdin-line" })?;
                    let Some(line) = line else {
                        self.controller.cancel();
                        break;
                    };
                    let Some(command) = Command::parse(&line) else {
                        continue;
                    };
                    if self.execute(command, &mut active)? == Flow::Quit {
                        break;
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context(ReadInputSnafu { stage: "listen-ctrl-c" })?;
                    if active.is_none() {
                        break;
                    }
                    self.execute(Command::Cancel, &mut active)?;
                }
            }
        }

        tracing::debug!("shell exiting");
        Ok(())
    }

    /// Runs one command. A started request is stored in `active` for the caller to pump.
    pub fn execute(
        &mut self,
        command: Command,
        active: &mut Option<ChatStream>,
    ) -> AppResult<Flow> {
        match command {
            Command::Send(text) => self.send(text, active)?,
            Command::Models => self.list_models()?,
            Command::Model(selector) => self.select_model(&selector)?,
            Command::Cancel => {
                if self.controller.cancel() {
                    *active = None;
                    self.say("\n(cancelled)")?;
                } else {
                    self.say("nothing to cancel")?;
                }
            }
            Command::Metrics => {
                let metrics = format_metrics(&self.controller.metrics());
                self.say(metrics)?;
            }
            Command::Compare => self.compare_models()?,
            Command::Clear => {
                self.controller.clear_history();
                *active = None;
                self.say("conversation cleared")?;
            }
            Command::History => {
                let history = format_history(self.controller.messages());
                self.say(history)?;
            }
            Command::Help => self.say(HELP)?,
            Command::Quit => {
                self.controller.cancel();
                *active = None;
                return Ok(Flow::Quit);
            }
            Command::Unknown(name) => self.say(format!("unknown command /{name}, try /help"))?,
        }
        Ok(Flow::Continue)
    }

    /// Applies one stream event and echoes accepted deltas. Returns `true` on terminal events.
    pub fn on_stream_event(&mut self, event: ChatStreamEvent) -> AppResult<bool> {
        let terminal = event.terminal_transition().is_some();
        let delta = match &event.payload {
            ChatStreamPayload::Delta(text) => Some(text.clone()),
            ChatStreamPayload::Finished | ChatStreamPayload::Failed(_) => None,
        };

        if !self.controller.handle_stream_event(event) {
            return Ok(terminal);
        }

        if let Some(text) = delta {
            self.print(text)?;
        }
        if terminal {
            self.finish_turn()?;
        }
        Ok(terminal)
    }

    pub fn on_stream_closed(&mut self, target: StreamTarget) -> AppResult<()> {
        let was_live = self.controller.phase().accepts_stream_event(target);
        self.controller.handle_stream_closed(target);
        if was_live {
            self.finish_turn()?;
        }
        Ok(())
    }

    fn send(&mut self, text: String, active: &mut Option<ChatStream>) -> AppResult<()> {
        if self.controller.is_loading() {
            return self.say("a reply is still streaming, use /cancel to stop it");
        }

        self.controller.set_input(text);
        match self.controller.send(self.selected_model.as_deref()) {
            Some(stream) => *active = Some(stream),
            None => {
                if let Some(error) = self.controller.error().map(str::to_string) {
                    self.say(format!("error: {error}"))?;
                }
            }
        }
        Ok(())
    }

    fn finish_turn(&mut self) -> AppResult<()> {
        self.print("\n")?;
        match self.controller.error().map(str::to_string) {
            Some(error) => self.say(format!("error: {error}")),
            None => {
                let summary = format_metrics_inline(&self.controller.metrics());
                self.say(summary)
            }
        }
    }

    fn list_models(&mut self) -> AppResult<()> {
        let mut lines = Vec::with_capacity(self.catalog.models.len() + 1);
        if let Some(warning) = &self.catalog.warning {
            lines.push(format!("({warning}; showing built-in list)"));
        }
        for (index, model) in self.catalog.models.iter().enumerate() {
            let marker = if self.selected_model.as_deref() == Some(model.id.as_str()) {
                '*'
            } else {
                ' '
            };
            lines.push(format!(
                "{marker}{:>2}. {} ({}) context {}, cost {}",
                index + 1,
                model.display_name(),
                model.id,
                format_context_length(model.context_length),
                format_cost(model.cost.as_ref()),
            ));
        }
        self.say(lines.join("\n"))
    }

    fn select_model(&mut self, selector: &str) -> AppResult<()> {
        let Some(model) = resolve_model(&self.catalog.models, selector).cloned() else {
            return self.say(format!("no model matches `{selector}`, see /models"));
        };

        self.selected_model = Some(model.id.clone());
        tracing::info!(model_id = %model.id, "selected model");
        self.say(format!("using {} ({})", model.display_name(), model.id))?;

        if let Err(error) = self
            .settings
            .set_default_model(&model.id)
            .context(SettingsSnafu {
                stage: "persist-default-model",
            })
        {
            tracing::warn!(error = %error, "failed to save default model");
            self.say(format!("warning: {error}"))?;
        }
        Ok(())
    }

    fn compare_models(&mut self) -> AppResult<()> {
        match self.recent.last_two() {
            Some((current, previous)) => {
                let comparison = ModelComparison::between(&current, &previous);
                self.print(comparison)?;
                self.flush()
            }
            None => {
                let hint = insufficient_models_message(self.recent.recent().len());
                self.say(hint)
            }
        }
    }

    fn print_banner(&mut self) -> AppResult<()> {
        let model = self
            .selected_model
            .clone()
            .unwrap_or_else(|| "none, pick one with /model".to_string());
        self.say(format!(
            "kindle chat. Model: {model}. Type /help for commands."
        ))
    }

    fn print(&mut self, text: impl Display) -> AppResult<()> {
        write!(self.out, "{text}").context(WriteOutputSnafu {
            stage: "write-stdout",
        })?;
        self.flush()
    }

    fn say(&mut self, text: impl Display) -> AppResult<()> {
        writeln!(self.out, "{text}").context(WriteOutputSnafu {
            stage: "write-stdout-line",
        })?;
        self.flush()
    }

    fn flush(&mut self) -> AppResult<()> {
        self.out.flush().context(WriteOutputSnafu {
            stage: "flush-stdout",
        })
    }
}
