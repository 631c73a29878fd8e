// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use std::{fs, io};

/// Creates an output directory and opens it up for user code running as
/// other users: mode 0777 plus the sticky bit, so files can be created by
/// anyone but only removed by their owners.
pub(crate) fn ensure_out_dir(dir: &Utf8Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o1777))?;
    }
    Ok(())
}
