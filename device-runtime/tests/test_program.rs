// Copyright 2018-2022 Clemens Lutz
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

use device_runtime::error::{ErrorKind, Result as RtResult};
use device_runtime::{Device, Kernel, KernelArg, LaunchContext, ProgramBuilder};
use std::error::Error;
use std::sync::Arc;

struct Noop;

impl Kernel for Noop {
    fn launch(&self, _ctx: &LaunchContext<'_>, _args: &[KernelArg]) -> RtResult<()> {
        Ok(())
    }
}

fn build_log_of(result: RtResult<device_runtime::Program>) -> String {
    match result {
        Err(e) => match e.kind() {
            ErrorKind::BuildFailure(log) => log.clone(),
            other => panic!("unexpected error kind: {:?}", other),
        },
        Ok(_) => panic!("build unexpectedly succeeded"),
    }
}

#[test]
fn build_succeeds_with_bound_kernels() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().build()?;
    let source = "/* library */\n__kernel void a(int x) { if (x) { } }\n__kernel void b() { }\n";
    let program = ProgramBuilder::new(source)
        .kernel("a", Arc::new(Noop))
        .kernel("b", Arc::new(Noop))
        .build(&device)?;

    assert_eq!(program.source(), source);
    assert!(program.build_log().contains("2 kernel(s) [a, b]"));
    assert!(program.kernel("a").is_ok());
    assert!(program.kernel("c").is_err());

    Ok(())
}

#[test]
fn unbound_entry_point_is_a_build_error() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().build()?;
    let log = build_log_of(
        ProgramBuilder::new("\n\n__kernel void missing() {}\n").build(&device),
    );
    assert!(log.contains("line 3: error: undefined reference to kernel 'missing'"));

    Ok(())
}

#[test]
fn unbalanced_source_is_a_build_error() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().build()?;
    let log = build_log_of(
        ProgramBuilder::new("__kernel void k() {\n  if (x {\n  }\n}\n")
            .kernel("k", Arc::new(Noop))
            .build(&device),
    );
    assert!(log.contains("line 4: error: unexpected '}', '(' opened at line 2 is not closed"));
    assert!(log.contains("line 1: error: '{' is never closed"));

    Ok(())
}
