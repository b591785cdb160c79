//! Fixed percentage → letter grade → GPA points table.
//!
//! Letters follow an 11-step scale; GPA points follow the coarse 4/3/2/1/0
//! scale. Lookups are cached by the percentage rounded to two decimals, so
//! the cache can never hold more than 10 001 entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::Serialize;

use crate::models::LetterGrade;

const LETTER_TABLE: [(f64, LetterGrade); 11] = [
    (97.0, LetterGrade::APlus),
    (93.0, LetterGrade::A),
    (90.0, LetterGrade::AMinus),
    (87.0, LetterGrade::BPlus),
    (83.0, LetterGrade::B),
    (80.0, LetterGrade::BMinus),
    (77.0, LetterGrade::CPlus),
    (73.0, LetterGrade::C),
    (70.0, LetterGrade::CMinus),
    (67.0, LetterGrade::DPlus),
    (65.0, LetterGrade::D),
];

const GPA_TABLE: [(f64, f64); 4] = [(90.0, 4.0), (80.0, 3.0), (70.0, 2.0), (65.0, 1.0)];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub letter_grade: LetterGrade,
    pub gpa_points: f64,
}

/// Memoizing classifier. Most callers want the process-wide [`classify`].
#[derive(Debug, Default)]
pub struct Classifier {
    cache: RwLock<HashMap<u16, Classification>>,
    misses: AtomicU64,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, percentage: f64) -> Classification {
        let key = cache_key(percentage);
        if let Some(hit) = self.cache.read().get(&key) {
            return *hit;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let computed = compute(f64::from(key) / 100.0);
        tracing::debug!(key, letter = %computed.letter_grade, "classification cache miss");
        *self.cache.write().entry(key).or_insert(computed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.read().len()
    }
}

pub fn classify(percentage: f64) -> Classification {
    static SHARED: OnceLock<Classifier> = OnceLock::new();
    SHARED.get_or_init(Classifier::new).classify(percentage)
}

pub fn letter_grade(percentage: f64) -> LetterGrade {
    classify(percentage).letter_grade
}

pub fn gpa_points(percentage: f64) -> f64 {
    classify(percentage).gpa_points
}

// Out-of-range and NaN inputs clamp to the boundary tiers.
fn cache_key(percentage: f64) -> u16 {
    let clamped = if percentage.is_nan() {
        0.0
    } else {
        percentage.clamp(0.0, 100.0)
    };
    (clamped * 100.0).round() as u16
}

fn compute(percentage: f64) -> Classification {
    let letter_grade = LETTER_TABLE
        .iter()
        .find(|(threshold, _)| percentage >= *threshold)
        .map_or(LetterGrade::F, |(_, letter)| *letter);
    let gpa_points = GPA_TABLE
        .iter()
        .find(|(threshold, _)| percentage >= *threshold)
        .map_or(0.0, |(_, points)| *points);
    Classification {
        letter_grade,
        gpa_points,
    }
}
