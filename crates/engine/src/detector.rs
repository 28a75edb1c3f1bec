//! Loop and deviation detection.
//!
//! Watches the stream of tool invocations within one turn and nudges the
//! model when it spins: identical calls repeated, a tool returning nothing
//! again and again, or activity wandering away from the goal. Nudges are
//! advisory corrective notes injected into the next context, each issued
//! once per streak. Only the hard repeat ceiling terminates a turn.
//!
//! Fingerprints are SHA-256 over the tool name and its canonically
//! serialized arguments (serde_json orders object keys), so semantically
//! identical calls hash identically regardless of argument order.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use taskloom_config::DetectorSettings;

/// What the control loop should do after a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Nothing suspicious
    Proceed,
    /// Inject this corrective note before the next completion
    Nudge(String),
    /// Repeat ceiling hit: stop iterating and force a final answer
    Terminate(String),
}

#[derive(Debug, Clone)]
struct ObservedCall {
    fingerprint: String,
    tool: String,
    args_text: String,
}

/// Per-turn detector state. Reset between turns (and between plan steps).
pub struct LoopDetector {
    settings: DetectorSettings,
    window: VecDeque<ObservedCall>,
    repeat_streak: u32,
    last_fingerprint: Option<String>,
    empty_streaks: HashMap<String, u32>,
    expected_tools: Vec<String>,
    off_expected_streak: u32,
    issued: HashSet<String>,
}

impl LoopDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            settings,
            window: VecDeque::new(),
            repeat_streak: 0,
            last_fingerprint: None,
            empty_streaks: HashMap::new(),
            expected_tools: Vec::new(),
            off_expected_streak: 0,
            issued: HashSet::new(),
        }
    }

    /// Tools the current task is expected to use (from a plan step's tool
    /// hint). Calls outside this set feed the drift streak.
    pub fn with_expected_tools(mut self, tools: Vec<String>) -> Self {
        self.expected_tools = tools;
        self
    }

    /// Clear all streaks for a fresh turn or plan step.
    pub fn reset(&mut self) {
        self.window.clear();
        self.repeat_streak = 0;
        self.last_fingerprint = None;
        self.empty_streaks.clear();
        self.off_expected_streak = 0;
        self.issued.clear();
    }

    /// Fingerprint one invocation.
    pub fn fingerprint(tool: &str, arguments: &serde_json::Value) -> String {
        let canonical = serde_json::to_string(arguments).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update(b":");
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        digest[..6].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Record an invocation the model just requested.
    pub fn observe_call(&mut self, tool: &str, arguments: &serde_json::Value) {
        let fingerprint = Self::fingerprint(tool, arguments);

        if self.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            self.repeat_streak += 1;
        } else {
            self.repeat_streak = 1;
            self.last_fingerprint = Some(fingerprint.clone());
        }

        if !self.expected_tools.is_empty() {
            if self.expected_tools.iter().any(|t| t == tool) {
                self.off_expected_streak = 0;
                self.issued.remove("drift:expected");
            } else {
                self.off_expected_streak += 1;
            }
        }

        self.window.push_back(ObservedCall {
            fingerprint,
            tool: tool.to_string(),
            args_text: serde_json::to_string(arguments).unwrap_or_default(),
        });
        while self.window.len() > self.settings.window_size {
            self.window.pop_front();
        }
    }

    /// Record a tool's (shaped) output.
    pub fn observe_result(&mut self, tool: &str, output: &str) {
        if output.trim().is_empty() {
            *self.empty_streaks.entry(tool.to_string()).or_insert(0) += 1;
        } else {
            self.empty_streaks.remove(tool);
            self.issued.remove(&format!("empty:{tool}"));
        }
    }

    /// Whether any corrective note has been issued this turn.
    pub fn tripped(&self) -> bool {
        !self.issued.is_empty()
    }

    /// Judge the turn after a batch. `iteration` is 1-based; `goal` is the
    /// user's original request, used by the periodic overlap check.
    pub fn verdict(&mut self, iteration: u32, goal: &str) -> Verdict {
        if self.repeat_streak >= self.settings.repeat_ceiling {
            let tool = self.last_tool().unwrap_or_default();
            return Verdict::Terminate(format!(
                "the same {tool} call was repeated {} times",
                self.repeat_streak
            ));
        }

        // Advisory checks, most specific first. Each fires once per streak:
        // the key names the streak it belongs to and is cleared when that
        // streak resets.
        if let Some((key, note)) = self.drift_note(iteration, goal) {
            return self.issue(key, note);
        }
        if let Some((key, note)) = self.empty_note() {
            return self.issue(key, note);
        }
        if let Some((key, note)) = self.repeat_note() {
            return self.issue(key, note);
        }
        Verdict::Proceed
    }

    fn last_tool(&self) -> Option<String> {
        self.window.back().map(|c| c.tool.clone())
    }

    fn issue(&mut self, key: String, note: String) -> Verdict {
        if self.issued.insert(key) {
            Verdict::Nudge(note)
        } else {
            tracing::debug!("corrective note suppressed: already issued for this streak");
            Verdict::Proceed
        }
    }

    fn repeat_note(&self) -> Option<(String, String)> {
        if self.repeat_streak < self.settings.repeat_threshold {
            return None;
        }
        let tool = self.window.back()?.tool.clone();
        let key = format!("repeat:{}", self.last_fingerprint.as_deref().unwrap_or(""));
        Some((
            key,
            format!(
                "You have called `{tool}` with identical arguments {} times. \
                 Repeating it will not change the result. Change your approach, \
                 or answer with the information you already have.",
                self.repeat_streak
            ),
        ))
    }

    fn empty_note(&self) -> Option<(String, String)> {
        let (tool, count) = self
            .empty_streaks
            .iter()
            .find(|&(_, &count)| count >= self.settings.empty_result_threshold)?;
        Some((
            format!("empty:{tool}"),
            format!(
                "`{tool}` has returned an empty result {count} times in a row. \
                 The absence of results is itself an answer — report it instead \
                 of searching again."
            ),
        ))
    }

    fn drift_note(&self, iteration: u32, goal: &str) -> Option<(String, String)> {
        if !self.expected_tools.is_empty()
            && self.off_expected_streak >= self.settings.drift_threshold
        {
            let recent: Vec<&str> = self
                .window
                .iter()
                .rev()
                .take(self.off_expected_streak as usize)
                .map(|c| c.tool.as_str())
                .collect();
            return Some((
                "drift:expected".to_string(),
                format!(
                    "Recent tool calls ({}) fall outside the tools expected for \
                     this task ({}). Refocus on the goal: {goal}",
                    recent.join(", "),
                    self.expected_tools.join(", ")
                ),
            ));
        }

        // Periodic advisory check: does recent activity still mention the
        // goal at all?
        if iteration > 0
            && iteration % self.settings.drift_check_interval == 0
            && self.window.len() >= 3
            && !self.goal_overlap(goal)
        {
            return Some((
                "drift:overlap".to_string(),
                format!(
                    "Your recent tool activity shows no overlap with the stated \
                     goal. Re-read the goal and course-correct: {goal}"
                ),
            ));
        }
        None
    }

    /// Crude keyword overlap between goal terms and recent activity.
    fn goal_overlap(&self, goal: &str) -> bool {
        let terms: Vec<String> = goal
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|w| !w.is_empty())
            .collect();
        if terms.is_empty() {
            return true;
        }
        let activity = self
            .window
            .iter()
            .map(|c| format!("{} {}", c.tool, c.args_text.to_lowercase()))
            .collect::<Vec<_>>()
            .join(" ");
        terms.iter().any(|t| activity.contains(t.as_str()))
    }
}
