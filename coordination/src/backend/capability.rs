//! Static capability profile declared by each backend at registration.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::problem::{ProblemType, SizeClass};

/// Which problem shapes a backend handles and how strongly it prefers them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub problem_types: BTreeSet<ProblemType>,
    pub size_classes: BTreeSet<SizeClass>,
    /// Baseline ranking score before bonuses and history.
    #[serde(default = "default_base_score")]
    pub base_score: f64,
    /// Extra score for specific (type, size) pairs the backend excels at.
    #[serde(default, with = "bonus_table")]
    pub bonuses: BTreeMap<(ProblemType, SizeClass), f64>,
}

fn default_base_score() -> f64 {
    1.0
}

impl CapabilityProfile {
    pub fn new(
        problem_types: impl IntoIterator<Item = ProblemType>,
        size_classes: impl IntoIterator<Item = SizeClass>,
    ) -> Self {
        Self {
            problem_types: problem_types.into_iter().collect(),
            size_classes: size_classes.into_iter().collect(),
            base_score: default_base_score(),
            bonuses: BTreeMap::new(),
        }
    }

    /// Every problem type and size class.
    pub fn universal() -> Self {
        Self::new(
            ProblemType::all().iter().copied(),
            SizeClass::all().iter().copied(),
        )
    }

    pub fn with_base_score(mut self, score: f64) -> Self {
        self.base_score = score;
        self
    }

    pub fn with_bonus(mut self, problem_type: ProblemType, size: SizeClass, bonus: f64) -> Self {
        self.bonuses.insert((problem_type, size), bonus);
        self
    }

    pub fn supports(&self, problem_type: ProblemType, size: SizeClass) -> bool {
        self.problem_types.contains(&problem_type) && self.size_classes.contains(&size)
    }

    pub fn bonus(&self, problem_type: ProblemType, size: SizeClass) -> f64 {
        self.bonuses
            .get(&(problem_type, size))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Tuple keys don't map onto JSON/TOML objects, so bonuses travel as a list.
mod bonus_table {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::problem::{ProblemType, SizeClass};

    #[derive(Serialize, Deserialize)]
    struct Entry {
        problem_type: ProblemType,
        size_class: SizeClass,
        bonus: f64,
    }

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<(ProblemType, SizeClass), f64>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let entries: Vec<Entry> = map
            .iter()
            .map(|(&(problem_type, size_class), &bonus)| Entry {
                problem_type,
                size_class,
                bonus,
            })
            .collect();
        entries.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<(ProblemType, SizeClass), f64>, D::Error> {
        let entries = Vec::<Entry>::deserialize(d)?;
        Ok(entries
            .into_iter()
            .map(|e| ((e.problem_type, e.size_class), e.bonus))
            .collect())
    }
}
