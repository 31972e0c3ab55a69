// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod ctx;

use uuid::Uuid;

/// Generate a name for a test object that won't collide with any other run
/// against the same cluster.
pub fn generate_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}
