//! Competition ranking over overlapping partitions.
//!
//! Every candidate may sit in many partitions at once (its subject overall,
//! its school, ward, council and region, each optionally split by sex or by
//! ownership). Partitions never interact, so they are ranked in parallel.

use crate::engine::types::{
    Geography, Ownership, Position, RankField, RankMap, Scope, Sex, Split, StudentProfile,
};
use crate::engine::utility::valid;
use rayon::prelude::*;
use std::collections::HashMap;

/// Attribute filter of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Filter<T> {
    Any,
    Only(T),
}

/// Identifies one ranking group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub scope: Scope,
    /// Subject code for subject rankings, `None` for composite rankings.
    pub subject: Option<String>,
    /// Full ancestor chain, e.g. `region/council/ward`. `None` for global.
    pub geography: Option<String>,
    pub sex: Filter<Sex>,
    pub ownership: Filter<Ownership>,
}

/// One rankable value together with the attributes partitions filter on.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub value: Option<f64>,
    pub subject: Option<&'a str>,
    pub profile: &'a StudentProfile,
}

/// Rank fields written on subject mark records.
pub fn subject_plan() -> Vec<RankField> {
    Scope::ALL
        .into_iter()
        .flat_map(|scope| {
            [Split::All, Split::Sex, Split::Ownership]
                .into_iter()
                .map(move |split| RankField::new(scope, split))
        })
        .collect()
}

/// Rank fields written on student composite records.
pub fn composite_plan() -> Vec<RankField> {
    let mut plan: Vec<RankField> = Scope::ALL
        .into_iter()
        .flat_map(|scope| {
            [Split::All, Split::Ownership]
                .into_iter()
                .map(move |split| RankField::new(scope, split))
        })
        .collect();
    plan.push(RankField::new(Scope::Global, Split::Sex));
    plan
}

fn part(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// The geography value of `scope`, present only if every ancestor is set.
pub fn geography_value(geography: &Geography, scope: Scope) -> Option<Option<String>> {
    let chain: &[&Option<String>] = match scope {
        Scope::Global => return Some(None),
        Scope::Region => &[&geography.region],
        Scope::Council => &[&geography.region, &geography.council],
        Scope::Ward => &[&geography.region, &geography.council, &geography.ward],
        Scope::School => &[
            &geography.region,
            &geography.council,
            &geography.ward,
            &geography.centre,
        ],
    };
    let parts = chain.iter().map(|p| part(p)).collect::<Option<Vec<_>>>()?;
    Some(Some(parts.join("/")))
}

/// The partition `candidate` belongs to for `field`, if it is eligible.
pub fn partition_key(field: RankField, candidate: &Candidate<'_>) -> Option<PartitionKey> {
    let profile = candidate.profile;
    let geography = geography_value(&profile.geography, field.scope)?;

    let sex = match field.split {
        Split::Sex => Filter::Only(profile.sex?),
        _ => Filter::Any,
    };
    let ownership = match field.split {
        Split::Ownership => match profile.ownership? {
            Ownership::Unknown => return None,
            known => Filter::Only(known),
        },
        _ => Filter::Any,
    };

    Some(PartitionKey {
        scope: field.scope,
        subject: candidate.subject.map(str::to_string),
        geography,
        sex,
        ownership,
    })
}

/// Assigns competition ("min") ranks: `1 + count(strictly greater)`.
/// Every member gets `out_of` = number of members.
pub fn competition_rank<T>(mut members: Vec<(T, f64)>) -> Vec<(T, Position)> {
    members.sort_by(|a, b| b.1.total_cmp(&a.1));
    let out_of = members.len() as u32;

    let mut ranked = Vec::with_capacity(members.len());
    let mut rank = 0;
    let mut previous: Option<f64> = None;
    for (index, (item, value)) in members.into_iter().enumerate() {
        if previous != Some(value) {
            rank = index as u32 + 1;
            previous = Some(value);
        }
        ranked.push((item, Position { rank, out_of }));
    }
    ranked
}

/// Ranks `candidates` for every field in `plan`.
///
/// Returns one [`RankMap`] per candidate, in input order. Candidates without a
/// valid value get an empty map and count toward no `out_of`.
pub fn rank(candidates: &[Candidate<'_>], plan: &[RankField]) -> Vec<RankMap> {
    let mut partitions: HashMap<(RankField, PartitionKey), Vec<(usize, f64)>> = HashMap::new();

    for (index, candidate) in candidates.iter().enumerate() {
        let Some(value) = valid(candidate.value) else {
            continue;
        };
        for &field in plan {
            if let Some(key) = partition_key(field, candidate) {
                partitions
                    .entry((field, key))
                    .or_default()
                    .push((index, value));
            }
        }
    }

    let ranked: Vec<(RankField, Vec<(usize, Position)>)> = partitions
        .into_par_iter()
        .map(|((field, _), members)| (field, competition_rank(members)))
        .collect();

    let mut out = vec![RankMap::new(); candidates.len()];
    for (field, members) in ranked {
        for (index, position) in members {
            out[index].insert(field, position);
        }
    }
    out
}
