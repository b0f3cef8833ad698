/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! Generators for single relation attributes.
//!
//! The sequential generators take the random number generator as an argument,
//! so that a seeded generator reproduces the same relation. The parallel
//! generators use a thread-local generator per worker.

use crate::error::{ErrorKind, Result};
use rand::distributions::{Alphanumeric, Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use rayon::prelude::*;
use std::convert::TryFrom;
use std::ops::RangeInclusive;
use zipf::ZipfDistribution;

/// An integer type that can be used as a join key.
pub trait KeyAttribute: Copy + Send + Sync {
    /// A key that never matches a generated primary key.
    fn null_key() -> Self;

    fn try_from_usize(x: usize) -> Result<Self>;

    fn is_null_key(self) -> bool;
}

macro_rules! impl_key_attribute {
    ($($ty:ty),*) => {
        $(
            impl KeyAttribute for $ty {
                fn null_key() -> Self {
                    -1
                }

                fn try_from_usize(x: usize) -> Result<Self> {
                    Self::try_from(x).map_err(|_| {
                        ErrorKind::IntegerOverflow(format!(
                            "key {} doesn't fit into {}",
                            x,
                            stringify!($ty)
                        ))
                        .into()
                    })
                }

                fn is_null_key(self) -> bool {
                    self < 0
                }
            }
        )*
    };
}

impl_key_attribute!(i32, i64);

/// Decides per key whether it is kept, given a selectivity in percent.
fn keep_key<R: Rng + ?Sized>(selectivity: u32, rng: &mut R) -> bool {
    selectivity >= 100 || rng.gen_range(0, 100) < selectivity
}

/// Generator for relations with uniform distribution.
pub struct UniformRelation;

impl UniformRelation {
    /// Generates a primary key attribute.
    ///
    /// The keys are unique and range from 1 to `attr.len()`, in random order.
    /// `selectivity` is the percentage of keys that are kept. The other keys
    /// are replaced by the null key. By default (`None`), all keys are kept.
    pub fn gen_primary_key<T, R>(attr: &mut [T], selectivity: Option<u32>, rng: &mut R) -> Result<()>
    where
        T: KeyAttribute,
        R: Rng + ?Sized,
    {
        let selectivity = selectivity.unwrap_or(100);

        for (x, i) in attr.iter_mut().zip(1..) {
            *x = if keep_key(selectivity, rng) {
                T::try_from_usize(i)?
            } else {
                T::null_key()
            };
        }

        attr.shuffle(rng);
        Ok(())
    }

    /// Generates a primary key attribute in parallel.
    ///
    /// Same as [`gen_primary_key`](UniformRelation::gen_primary_key), but
    /// neither seeded nor reproducible.
    pub fn gen_primary_key_par<T: KeyAttribute>(
        attr: &mut [T],
        selectivity: Option<u32>,
    ) -> Result<()> {
        let selectivity = selectivity.unwrap_or(100);
        let mut shuffled: Vec<(u64, T)> = (1..=attr.len())
            .into_par_iter()
            .map_init(thread_rng, |rng, i| -> Result<(u64, T)> {
                let key = if keep_key(selectivity, rng) {
                    T::try_from_usize(i)?
                } else {
                    T::null_key()
                };
                Ok((rng.gen(), key))
            })
            .collect::<Result<_>>()?;

        shuffled.par_sort_unstable_by_key(|x| x.0);

        attr.par_iter_mut()
            .zip_eq(shuffled.into_par_iter())
            .for_each(|(x, (_, key))| *x = key);

        Ok(())
    }

    /// Generates a foreign key attribute by sampling the primary keys.
    ///
    /// Each primary key occurs at least once if `fk_attr` is at least as long
    /// as `pk_attr`.
    pub fn gen_foreign_key_from_primary_key<T, R>(fk_attr: &mut [T], pk_attr: &[T], rng: &mut R)
    where
        T: Copy,
        R: Rng + ?Sized,
    {
        fk_attr
            .iter_mut()
            .zip(pk_attr.iter().cycle())
            .for_each(|(fk, pk)| *fk = *pk);
        fk_attr.shuffle(rng);
    }

    /// Generates a uniformly distributed attribute with values in `range`.
    pub fn gen_attr<T, R>(attr: &mut [T], range: RangeInclusive<usize>, rng: &mut R) -> Result<()>
    where
        T: KeyAttribute,
        R: Rng + ?Sized,
    {
        if range.is_empty() {
            Err(ErrorKind::InvalidArgument(format!(
                "empty value range {:?}",
                range
            )))?;
        }
        let between = Uniform::from(range);

        for x in attr.iter_mut() {
            *x = T::try_from_usize(between.sample(rng))?;
        }

        Ok(())
    }

    /// Generates a uniformly distributed attribute in parallel.
    pub fn gen_attr_par<T: KeyAttribute>(attr: &mut [T], range: RangeInclusive<usize>) -> Result<()> {
        if range.is_empty() {
            Err(ErrorKind::InvalidArgument(format!(
                "empty value range {:?}",
                range
            )))?;
        }
        let between = Uniform::from(range);

        attr.par_iter_mut()
            .map_init(thread_rng, |rng, x| -> Result<()> {
                *x = T::try_from_usize(between.sample(rng))?;
                Ok(())
            })
            .collect::<Result<()>>()
    }
}

/// Generator for relations with Zipf distribution.
pub struct ZipfRelation;

impl ZipfRelation {
    /// Generates an attribute following the Zipf distribution.
    ///
    /// The values are sampled from 1 to `num_elements` (inclusive). The
    /// exponent must be greater than 0.
    ///
    /// In the literature, `num_elements` is also called the alphabet size.
    pub fn gen_attr<T, R>(attr: &mut [T], num_elements: usize, exponent: f64, rng: &mut R) -> Result<()>
    where
        T: KeyAttribute,
        R: Rng + ?Sized,
    {
        let between = ZipfDistribution::new(num_elements, exponent).map_err(|_| {
            ErrorKind::InvalidArgument(
                "ZipfDistribution requires num_elements and exponent greater than 0".to_string(),
            )
        })?;

        for x in attr.iter_mut() {
            *x = T::try_from_usize(between.sample(rng))?;
        }

        Ok(())
    }
}

/// Generator for payload attributes.
pub struct PayloadAttribute;

impl PayloadAttribute {
    /// Fills `attr` with random alphanumeric strings of `len` characters.
    pub fn gen_text<R: Rng + ?Sized>(attr: &mut [String], len: usize, rng: &mut R) {
        for x in attr.iter_mut() {
            *x = (0..len).map(|_| rng.sample(Alphanumeric)).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn primary_keys_are_a_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut keys = vec![0_i64; 100];
        UniformRelation::gen_primary_key(&mut keys, None, &mut rng).unwrap();

        keys.sort_unstable();
        assert_eq!(keys, (1..=100).collect::<Vec<i64>>());
    }

    #[test]
    fn selectivity_replaces_keys_by_null_key() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut keys = vec![0_i32; 1000];
        UniformRelation::gen_primary_key(&mut keys, Some(0), &mut rng).unwrap();

        assert!(keys.iter().all(|k| k.is_null_key()));
    }

    #[test]
    fn foreign_keys_cover_primary_keys() {
        let mut rng = StdRng::seed_from_u64(3);
        let pk = vec![4_i64, 2, 9];
        let mut fk = vec![0_i64; 6];
        UniformRelation::gen_foreign_key_from_primary_key(&mut fk, &pk, &mut rng);

        fk.sort_unstable();
        assert_eq!(fk, vec![2, 2, 4, 4, 9, 9]);
    }

    #[test]
    fn zipf_values_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut attr = vec![0_i64; 500];
        ZipfRelation::gen_attr(&mut attr, 10, 1.2, &mut rng).unwrap();

        assert!(attr.iter().all(|&x| x >= 1 && x <= 10));
    }

    #[test]
    fn parallel_primary_keys_are_unique() {
        let mut keys = vec![0_i64; 10_000];
        UniformRelation::gen_primary_key_par(&mut keys, None).unwrap();

        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 10_000);
    }
}
