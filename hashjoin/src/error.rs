/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use error_chain::error_chain;

error_chain! {
    errors {
        /// The command line describes a benchmark that cannot run.
        InvalidArgument(msg: String) {
            description("invalid benchmark configuration")
            display("invalid benchmark configuration: {}", msg)
        }
        /// The join disagrees with the host-side reference count.
        ResultMismatch(expected: usize, actual: usize) {
            description("join result mismatch")
            display("expected {} result rows, but the join produced {}", expected, actual)
        }
    }

    foreign_links {
        Csv(csv::Error);
        Datagen(datagen::error::Error);
        Device(device_runtime::error::Error);
        Io(std::io::Error);
        SqlOps(sql_ops::error::Error);
    }
}
