// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Relations for a chain join.
//!
//! ```text
//! outer(fk, payload) -> inner_1(pk, fk, payload) -> ... -> inner_n(pk, payload)
//! ```
//!
//! The foreign key of each relation references the primary key of the
//! relation at the next depth.

use crate::error::{Error, Result};
use crate::relation::{KeyAttribute, PayloadAttribute, UniformRelation, ZipfRelation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Unseeded relations with at least this many rows are generated in parallel.
pub const PARALLEL_MIN_LEN: usize = 1 << 16;

/// The distribution of foreign keys.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KeyDistribution {
    Uniform,
    /// Foreign keys are drawn from the referenced primary keys, so that each
    /// of them is referenced at least once if the referencing relation is
    /// large enough. Null primary keys yield null foreign keys.
    Dense,
    Zipf { exponent: f64 },
}

/// One generated relation, stored column by column.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Relation {
    /// Primary keys. Empty for the outer relation.
    pub primary_key: Vec<i64>,
    /// Foreign keys into the next depth. Empty for the last depth.
    pub foreign_key: Vec<i64>,
    pub payload: Vec<String>,
}

impl Relation {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The width of a row in bytes, excluding the payload.
    pub fn key_bytes(&self) -> usize {
        let pk = if self.primary_key.is_empty() { 0 } else { 8 };
        let fk = if self.foreign_key.is_empty() { 0 } else { 8 };
        pk + fk
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChainRelations {
    pub outer: Relation,
    /// `inners[0]` is the relation at depth 1.
    pub inners: Vec<Relation>,
}

/// Describes the relations of a chain join.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainSpec {
    pub outer_len: usize,
    pub inner_lens: Vec<usize>,
    /// Percentage of primary keys that are kept. The rest are null keys.
    pub selectivity: Option<u32>,
    pub distribution: KeyDistribution,
    /// Characters per payload.
    pub payload_len: usize,
    /// Generates the same relations on each run if set.
    pub seed: Option<u64>,
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self {
            outer_len: 1000,
            inner_lens: vec![1000],
            selectivity: None,
            distribution: KeyDistribution::Uniform,
            payload_len: 8,
            seed: None,
        }
    }
}

impl ChainSpec {
    fn validate(&self) -> Result<()> {
        if self.inner_lens.is_empty() {
            return Err(Error::invalid_chain(1, "the chain has no inner relation"));
        }
        if let Some(index) = self.inner_lens.iter().position(|&len| len == 0) {
            return Err(Error::invalid_chain(index + 1, "relation is empty"));
        }
        if let Some(selectivity) = self.selectivity {
            if selectivity > 100 {
                return Err(Error::invalid_chain(
                    0,
                    "selectivity is a percentage between 0 and 100",
                ));
            }
        }
        Ok(())
    }

    /// Generates the outer relation and the inner relations.
    ///
    /// Unseeded relations of at least `PARALLEL_MIN_LEN` rows are generated
    /// in parallel.
    pub fn generate(&self) -> Result<ChainRelations> {
        self.validate()?;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let primary_keys = self
            .inner_lens
            .iter()
            .map(|&len| self.primary_key(len, &mut rng))
            .collect::<Result<Vec<_>>>()?;

        let outer = Relation {
            primary_key: Vec::new(),
            foreign_key: self.foreign_key(self.outer_len, &primary_keys[0], &mut rng)?,
            payload: self.payload(self.outer_len, &mut rng),
        };

        let mut inners = Vec::with_capacity(primary_keys.len());
        for (depth, primary_key) in primary_keys.iter().enumerate() {
            let len = primary_key.len();
            let foreign_key = match primary_keys.get(depth + 1) {
                Some(referenced) => self.foreign_key(len, referenced, &mut rng)?,
                None => Vec::new(),
            };
            inners.push(Relation {
                primary_key: primary_key.clone(),
                foreign_key,
                payload: self.payload(len, &mut rng),
            });
        }

        Ok(ChainRelations { outer, inners })
    }

    fn parallel(&self, len: usize) -> bool {
        self.seed.is_none() && len >= PARALLEL_MIN_LEN
    }

    fn primary_key<R: Rng>(&self, len: usize, rng: &mut R) -> Result<Vec<i64>> {
        let mut attr = vec![i64::null_key(); len];
        if self.parallel(len) {
            UniformRelation::gen_primary_key_par(&mut attr, self.selectivity)?;
        } else {
            UniformRelation::gen_primary_key(&mut attr, self.selectivity, rng)?;
        }
        Ok(attr)
    }

    fn foreign_key<R: Rng>(&self, len: usize, referenced: &[i64], rng: &mut R) -> Result<Vec<i64>> {
        let mut attr = vec![i64::null_key(); len];
        let range = 1..=referenced.len();
        match self.distribution {
            KeyDistribution::Uniform if self.parallel(len) => {
                UniformRelation::gen_attr_par(&mut attr, range)?
            }
            KeyDistribution::Uniform => UniformRelation::gen_attr(&mut attr, range, rng)?,
            KeyDistribution::Dense => {
                UniformRelation::gen_foreign_key_from_primary_key(&mut attr, referenced, rng)
            }
            KeyDistribution::Zipf { exponent } => {
                ZipfRelation::gen_attr(&mut attr, referenced.len(), exponent, rng)?
            }
        }
        Ok(attr)
    }

    fn payload<R: Rng>(&self, len: usize, rng: &mut R) -> Vec<String> {
        let mut attr = vec![String::new(); len];
        PayloadAttribute::gen_text(&mut attr, self.payload_len, rng);
        attr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn spec() -> ChainSpec {
        ChainSpec {
            outer_len: 200,
            inner_lens: vec![50, 20],
            seed: Some(42),
            ..ChainSpec::default()
        }
    }

    #[test]
    fn foreign_keys_reference_next_depth() {
        let chain = spec().generate().unwrap();

        assert_eq!(chain.outer.len(), 200);
        assert!(chain.outer.foreign_key.iter().all(|&k| k >= 1 && k <= 50));
        assert!(chain.inners[0].foreign_key.iter().all(|&k| k >= 1 && k <= 20));
        assert!(chain.inners[1].foreign_key.is_empty());
        assert_eq!(chain.inners[1].key_bytes(), 8);
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        assert_eq!(spec().generate().unwrap(), spec().generate().unwrap());
    }

    #[test]
    fn dense_foreign_keys_reference_every_primary_key() {
        let spec = ChainSpec {
            distribution: KeyDistribution::Dense,
            selectivity: Some(50),
            ..spec()
        };
        let chain = spec.generate().unwrap();

        let mut referenced = chain.outer.foreign_key.clone();
        referenced.sort_unstable();
        referenced.dedup();
        let mut primary_keys = chain.inners[0].primary_key.clone();
        primary_keys.sort_unstable();
        primary_keys.dedup();
        assert_eq!(referenced, primary_keys);
        assert!(primary_keys.iter().any(|k| k.is_null_key()));
    }

    #[test]
    fn large_unseeded_relations_are_generated_in_parallel() {
        let spec = ChainSpec {
            outer_len: PARALLEL_MIN_LEN,
            inner_lens: vec![PARALLEL_MIN_LEN],
            seed: None,
            ..spec()
        };
        assert!(spec.parallel(PARALLEL_MIN_LEN));
        let chain = spec.generate().unwrap();

        let mut primary_keys = chain.inners[0].primary_key.clone();
        primary_keys.sort_unstable();
        assert_eq!(primary_keys, (1..=PARALLEL_MIN_LEN as i64).collect::<Vec<_>>());
        assert!(chain
            .outer
            .foreign_key
            .iter()
            .all(|&k| k >= 1 && k <= PARALLEL_MIN_LEN as i64));
    }

    #[test]
    fn empty_inner_relation_is_rejected() {
        let spec = ChainSpec {
            inner_lens: vec![10, 0],
            ..spec()
        };

        match spec.generate() {
            Err(e) => assert_eq!(
                e.kind(),
                &ErrorKind::InvalidChain {
                    depth: 2,
                    reason: "relation is empty".to_string()
                }
            ),
            Ok(_) => panic!("generated a chain with an empty relation"),
        }
    }
}
