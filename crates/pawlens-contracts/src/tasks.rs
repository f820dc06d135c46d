use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::profile::PetProfile;

/// The three analysis tasks the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisTask {
    VideoMood,
    ImageIngredients,
    DietPlan,
}

impl AnalysisTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisTask::VideoMood => "video_mood",
            AnalysisTask::ImageIngredients => "image_ingredients",
            AnalysisTask::DietPlan => "diet_plan",
        }
    }
}

impl fmt::Display for AnalysisTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
}

/// Bounds the remote-processing wait loop. The interval is fixed (no
/// backoff growth); a poll still pending at the deadline fails the call.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: Duration::from_secs(120),
        }
    }
}

/// Per-task pipeline parameters: which media kind the task ingests (if
/// any), the ordered candidate models, and how to wait for preprocessing.
///
/// Candidate order is load-bearing: cheapest/fastest first, most capable or
/// most quota-constrained last. The cascade walks the list front to back and
/// stops at the first success.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task: AnalysisTask,
    pub media: Option<MediaKind>,
    pub candidates: Vec<String>,
    pub poll: PollPolicy,
}

/// Holds one `TaskSpec` per task, in a fixed iteration order.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    specs: IndexMap<AnalysisTask, TaskSpec>,
}

impl TaskRegistry {
    pub fn new(specs: Option<IndexMap<AnalysisTask, TaskSpec>>) -> Self {
        Self {
            specs: specs.unwrap_or_else(default_specs),
        }
    }

    pub fn get(&self, task: AnalysisTask) -> Option<&TaskSpec> {
        self.specs.get(&task)
    }

    pub fn list(&self) -> impl Iterator<Item = &TaskSpec> {
        self.specs.values()
    }

    /// Replace a task's candidate list, preserving the given order. Empty
    /// lists are rejected: the cascade requires at least one candidate.
    pub fn set_candidates(
        &mut self,
        task: AnalysisTask,
        candidates: Vec<String>,
    ) -> Result<(), String> {
        if candidates.iter().all(|name| name.trim().is_empty()) {
            return Err(format!("candidate list for {task} must not be empty"));
        }
        if let Some(spec) = self.specs.get_mut(&task) {
            spec.candidates = candidates
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
            Ok(())
        } else {
            Err(format!("unknown task {task}"))
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_specs() -> IndexMap<AnalysisTask, TaskSpec> {
    let mut map = IndexMap::new();

    map.insert(
        AnalysisTask::VideoMood,
        TaskSpec {
            task: AnalysisTask::VideoMood,
            media: Some(MediaKind::Video),
            candidates: vec![
                "gemini-2.5-flash".to_string(),
                "gemini-2.5-pro".to_string(),
                "gemini-2.0-flash".to_string(),
            ],
            poll: PollPolicy::new(Duration::from_secs(1), Duration::from_secs(120)),
        },
    );
    map.insert(
        AnalysisTask::ImageIngredients,
        TaskSpec {
            task: AnalysisTask::ImageIngredients,
            media: Some(MediaKind::Image),
            candidates: vec![
                "gemini-2.5-flash-lite".to_string(),
                "gemini-2.5-flash".to_string(),
                "gemini-2.5-pro".to_string(),
            ],
            poll: PollPolicy::new(Duration::from_millis(500), Duration::from_secs(120)),
        },
    );
    map.insert(
        AnalysisTask::DietPlan,
        TaskSpec {
            task: AnalysisTask::DietPlan,
            media: None,
            candidates: vec![
                "gemini-2.5-flash-lite".to_string(),
                "gemini-2.5-flash".to_string(),
                "gemini-2.0-flash".to_string(),
            ],
            poll: PollPolicy::default(),
        },
    );

    map
}

/// Builds the task prompt. Each prompt demands a single strict JSON object
/// with the task's key set; the diet-plan prompt interpolates the profile
/// and its computed targets.
pub fn prompt_for(task: AnalysisTask, profile: Option<&PetProfile>) -> String {
    match task {
        AnalysisTask::VideoMood => "You are a veterinary behaviorist. Watch the attached pet \
             video and assess the animal's emotional state. Reply with a single JSON object \
             using exactly these keys: \"mood\" (short emotion label), \"translation\" (one \
             first-person sentence of what the pet would say), \"energy_score\" (integer 1-10), \
             \"advice\" (one actionable sentence for the owner). Reply with the JSON object \
             only, no markdown fences and no surrounding prose."
            .to_string(),
        AnalysisTask::ImageIngredients => "You are a pet nutritionist. Read the attached pet \
             food label or bowl photo and judge the ingredient quality. Reply with a single \
             JSON object using exactly these keys: \"rating\" (integer 1-10), \"highlights\" \
             (array of strings, ingredients worth praising), \"concerns\" (array of strings, \
             ingredients to watch), \"advice\" (one sentence for the owner). Reply with the \
             JSON object only, no markdown fences and no surrounding prose."
            .to_string(),
        AnalysisTask::DietPlan => {
            let profile = profile.expect("diet plan prompt requires a profile");
            let preference = profile
                .preference
                .as_deref()
                .filter(|text| !text.trim().is_empty())
                .unwrap_or("none stated");
            format!(
                "You are a pet nutritionist. Design a one-day feeding plan for a {breed}, \
                 {age:.1} years old, {weight:.1} kg, {status}. Food preference: {preference}. \
                 Target approximately {kcal} kcal and {water} ml of water for the day. Reply \
                 with a single JSON object using exactly these keys: \"daily_calories_kcal\" \
                 (integer), \"daily_water_ml\" (integer), \"meal_plan\" (array of strings, one \
                 entry per meal with portion sizes), \"tips\" (array of strings). Reply with \
                 the JSON object only, no markdown fences and no surrounding prose.",
                breed = profile.breed.trim(),
                age = profile.age_years,
                weight = profile.weight_kg,
                status = profile.status,
                preference = preference,
                kcal = profile.daily_calorie_target(),
                water = profile.daily_water_target_ml(),
            )
        }
    }
}
