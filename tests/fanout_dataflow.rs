// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph sequencing and dataflow correctness, driven through a real
//! `LocalDispatcher` subprocess boundary rather than an in-process mock
//! surface — the full stack, `GraphExecutor` down to a child process.

use fanout::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Twelve;

impl Task for Twelve {
    type Args = ();
    type Output = i64;
    const SOURCE_TOKEN: &'static str = "fanout::tests::dataflow::twelve";

    fn call(self, _args: ()) -> i64 {
        12
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddOne;

impl Task for AddOne {
    type Args = i64;
    type Output = i64;
    const SOURCE_TOKEN: &'static str = "fanout::tests::dataflow::add_one";

    fn call(self, args: i64) -> i64 {
        args + 1
    }
}

/// Stands in for a built task executable: ignores stdin and answers with
/// `answer_bytes`, read back out of a sibling data file.
fn fixed_answer_script(answer_bytes: &[u8]) -> (tempfile::TempPath, tempfile::TempPath) {
    let mut data_file = tempfile::NamedTempFile::new().unwrap();
    data_file.write_all(answer_bytes).unwrap();
    let data_path = data_file.into_temp_path();

    let mut script_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        script_file,
        "#!/bin/sh\ncat >/dev/null\ncat {}",
        data_path.display()
    )
    .unwrap();
    let script_path = script_file.into_temp_path();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    (script_path, data_path)
}

#[tokio::test]
async fn graph_over_local_dispatcher_drives_real_subprocesses() {
    let twelve_id = fanout::task::identifier_of::<Twelve>();
    let add_one_id = fanout::task::identifier_of::<AddOne>();

    let twelve_answer = BinaryArchive::encode(&12i64).unwrap();
    let (twelve_script, _twelve_data) = fixed_answer_script(&twelve_answer);
    let add_one_answer = BinaryArchive::encode(&13i64).unwrap();
    let (add_one_script, _add_one_data) = fixed_answer_script(&add_one_answer);

    let factory = Arc::new(LocalDispatcherFactory::from_entry_points(vec![
        EntryPoint {
            original_function_name: twelve_id.clone(),
            filename: twelve_script.to_string_lossy().into_owned(),
            user_meta: twelve_id,
        },
        EntryPoint {
            original_function_name: add_one_id.clone(),
            filename: add_one_script.to_string_lossy().into_owned(),
            user_meta: add_one_id,
        },
    ]));
    let mut dispatcher = factory.create_instance().unwrap();

    let mut builder = GraphBuilder::new();
    let source = builder.schedule();
    let twelve = builder
        .then0::<Twelve, BinaryArchive>(source, Twelve)
        .unwrap();
    let thirteen = builder
        .then1::<AddOne, BinaryArchive>(twelve, AddOne)
        .unwrap();

    let surface: &mut dyn DispatchSurface = &mut dispatcher;
    GraphExecutor::new(surface)
        .run_to_completion(&mut builder)
        .unwrap();

    assert_eq!(builder.output_value(thirteen).unwrap(), 13);
}
