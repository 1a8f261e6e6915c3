//! Scripted [`SvnRunner`] for tests.

use super::command::{CommandOutput, RunnerFactory, SvnRunner};
use crate::config::RepositoryConfig;
use crate::error::SvnError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

type Responder = Box<dyn Fn(&[String], Option<&Path>) -> Option<CommandOutput> + Send + Sync>;

/// Replays canned outputs keyed by subcommand and records every invocation
///
/// Queued responses for a subcommand are consumed in order; when the queue is empty
/// the optional responder is consulted, then the per-subcommand default.
#[derive(Default)]
pub struct ScriptedRunner {
    queued: Mutex<HashMap<String, VecDeque<Result<CommandOutput, SvnError>>>>,
    defaults: Mutex<HashMap<String, CommandOutput>>,
    responder: Mutex<Option<Responder>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for a subcommand
    pub fn push(&self, subcommand: &str, output: CommandOutput) -> &Self {
        self.push_result(subcommand, Ok(output))
    }

    /// Queue one error (e.g. a timeout) for a subcommand
    pub fn push_result(&self, subcommand: &str, result: Result<CommandOutput, SvnError>) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry(subcommand.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// Response used whenever the queue for a subcommand is empty
    pub fn set_default(&self, subcommand: &str, output: CommandOutput) -> &Self {
        self.defaults
            .lock()
            .unwrap()
            .insert(subcommand.to_string(), output);
        self
    }

    /// Dynamic responder consulted after the queue
    pub fn set_responder<F>(&self, f: F) -> &Self
    where
        F: Fn(&[String], Option<&Path>) -> Option<CommandOutput> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
        self
    }

    /// All recorded invocations
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded invocations of one subcommand
    pub fn calls_to(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().map(String::as_str) == Some(subcommand))
            .collect()
    }
}

#[async_trait]
impl SvnRunner for ScriptedRunner {
    async fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<CommandOutput, SvnError> {
        self.calls.lock().unwrap().push(args.to_vec());
        let subcommand = args.first().cloned().unwrap_or_default();

        if let Some(result) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&subcommand)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }

        if let Some(responder) = self.responder.lock().unwrap().as_ref()
            && let Some(output) = responder(args, cwd)
        {
            return Ok(output);
        }

        Ok(self
            .defaults
            .lock()
            .unwrap()
            .get(&subcommand)
            .cloned()
            .unwrap_or_else(|| CommandOutput::failed(format!("unscripted svn {}", subcommand))))
    }
}

/// Factory handing out the same scripted runner for every repository
pub struct ScriptedFactory {
    runners: Mutex<HashMap<String, Arc<ScriptedRunner>>>,
    fallback: Arc<ScriptedRunner>,
}

impl ScriptedFactory {
    pub fn new(fallback: Arc<ScriptedRunner>) -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    /// Use a dedicated runner for one repository
    pub fn insert(&self, repo_name: &str, runner: Arc<ScriptedRunner>) {
        self.runners
            .lock()
            .unwrap()
            .insert(repo_name.to_string(), runner);
    }
}

impl RunnerFactory for ScriptedFactory {
    fn for_repository(&self, repo: &RepositoryConfig) -> Arc<dyn SvnRunner> {
        let runners = self.runners.lock().unwrap();
        match runners.get(&repo.name) {
            Some(runner) => runner.clone(),
            None => self.fallback.clone(),
        }
    }
}

/// One `<logentry>` element of an `svn log --xml -v` document
pub fn log_entry(
    revision: &str,
    author: &str,
    date: &str,
    message: &str,
    paths: &[(&str, &str)],
) -> String {
    let mut xml = format!("<logentry revision=\"{}\">\n", revision);
    xml.push_str(&format!("<author>{}</author>\n<date>{}</date>\n<paths>\n", author, date));
    for (action, path) in paths {
        xml.push_str(&format!(
            "<path action=\"{}\" kind=\"file\" text-mods=\"true\" prop-mods=\"false\">{}</path>\n",
            action, path
        ));
    }
    xml.push_str(&format!("</paths>\n<msg>{}</msg>\n</logentry>\n", message));
    xml
}

/// Wrap log entries into a complete `svn log --xml` document
pub fn log_xml(entries: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<log>\n{}</log>\n",
        entries.concat()
    )
}
