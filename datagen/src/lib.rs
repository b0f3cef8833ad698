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

//! Generators for relations that are joined in a chain.
//!
//! [`relation`] generates single attributes, i.e., primary keys, foreign keys
//! and payloads. [`chain`] combines them into an outer relation and a chain
//! of inner relations, in which each relation references the next one by a
//! foreign key.

pub mod chain;
pub mod error;
pub mod relation;
