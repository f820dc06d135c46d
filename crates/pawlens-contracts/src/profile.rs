use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Physiological status used to scale the resting energy requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PetStatus {
    Neutered,
    Intact,
    Overweight,
    Senior,
    Growing,
}

impl PetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PetStatus::Neutered => "neutered",
            PetStatus::Intact => "intact",
            PetStatus::Overweight => "overweight",
            PetStatus::Senior => "senior",
            PetStatus::Growing => "growing",
        }
    }

    /// Multiplier applied to the resting energy requirement.
    pub fn energy_factor(&self) -> f64 {
        match self {
            PetStatus::Neutered => 1.6,
            PetStatus::Intact => 1.8,
            PetStatus::Overweight => 1.0,
            PetStatus::Senior => 1.4,
            PetStatus::Growing => 2.5,
        }
    }
}

impl fmt::Display for PetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PetStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "neutered" | "spayed" => Ok(PetStatus::Neutered),
            "intact" => Ok(PetStatus::Intact),
            "overweight" => Ok(PetStatus::Overweight),
            "senior" => Ok(PetStatus::Senior),
            "growing" | "kitten" | "puppy" => Ok(PetStatus::Growing),
            other => Err(format!(
                "unknown pet status '{other}' (expected neutered, intact, overweight, senior or growing)"
            )),
        }
    }
}

/// Owner-declared facts about the animal, collected by the presentation
/// layer and interpolated into the feeding-plan prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PetProfile {
    pub breed: String,
    pub age_years: f64,
    pub weight_kg: f64,
    pub status: PetStatus,
    pub preference: Option<String>,
}

impl PetProfile {
    /// Resting energy requirement in kcal/day: 70 * kg^0.75.
    pub fn resting_energy_kcal(&self) -> f64 {
        70.0 * self.weight_kg.max(0.0).powf(0.75)
    }

    /// Daily calorie target: RER scaled by the status factor.
    pub fn daily_calorie_target(&self) -> u32 {
        (self.resting_energy_kcal() * self.status.energy_factor()).round() as u32
    }

    /// Daily water target in ml: 55 ml per kg of body weight.
    pub fn daily_water_target_ml(&self) -> u32 {
        (self.weight_kg.max(0.0) * 55.0).round() as u32
    }
}
