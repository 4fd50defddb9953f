use crate::embedding::{self, DimensionMismatch};
use crate::types::Person;

/// A roster entry that is close enough to a query embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Match<'a> {
    pub person: &'a Person,
    pub distance: f32,
}

/// Strategy for comparing a query embedding against the people roster.
pub trait Matcher {
    fn matches<'a>(
        &self,
        query: &[f32],
        roster: &'a [Person],
    ) -> Result<Vec<Match<'a>>, DimensionMismatch>;
}

/// Euclidean distance matcher.
///
/// Every roster entry strictly closer than `threshold` is reported, in
/// roster order. A single face may match several people.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Matcher for EuclideanMatcher {
    fn matches<'a>(
        &self,
        query: &[f32],
        roster: &'a [Person],
    ) -> Result<Vec<Match<'a>>, DimensionMismatch> {
        let mut hits = Vec::new();
        for person in roster {
            let distance = embedding::distance(query, &person.embedding)?;
            if distance < self.threshold {
                hits.push(Match { person, distance });
            }
        }
        Ok(hits)
    }
}
