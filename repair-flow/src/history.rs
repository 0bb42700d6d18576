use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::model::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateSource {
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub total: Money,
    pub recorded_at: DateTime<Utc>,
    pub source: EstimateSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Flat,
}

/// Ring buffer of the most recent settled totals; the oldest point is
/// evicted once the capacity is reached.
#[derive(Debug, Clone)]
pub struct TrendHistory {
    capacity: usize,
    points: VecDeque<TrendPoint>,
}

impl TrendHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    /// Rebuilds a history from persisted points, keeping the newest ones.
    pub fn restore(capacity: usize, points: impl IntoIterator<Item = TrendPoint>) -> Self {
        let mut history = Self::new(capacity);
        for point in points {
            history.push(point);
        }
        history
    }

    pub fn push(&mut self, point: TrendPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrendPoint> {
        self.points.iter()
    }

    pub fn latest(&self) -> Option<&TrendPoint> {
        self.points.back()
    }

    /// Direction of the last change; `None` until two points exist.
    pub fn trend(&self) -> Option<Trend> {
        let mut newest = self.points.iter().rev();
        let last = newest.next()?;
        let previous = newest.next()?;
        Some(match last.total.cmp(&previous.total) {
            std::cmp::Ordering::Greater => Trend::Rising,
            std::cmp::Ordering::Less => Trend::Falling,
            std::cmp::Ordering::Equal => Trend::Flat,
        })
    }

    pub fn to_vec(&self) -> Vec<TrendPoint> {
        self.points.iter().cloned().collect()
    }
}
