/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fs;
use tracing::warn;

static OS_INFO_FILE: &str = "/etc/os-release";

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum OperatingSystem {
    Ubuntu,
    OpenEuler,
    Unsupported,
}

pub fn get_os() -> OperatingSystem {
    match fs::read_to_string(OS_INFO_FILE) {
        Ok(content) => parse_os_release(&content),
        Err(_) => {
            warn!(
                "Could not detect operating system. {} does not exist!",
                OS_INFO_FILE
            );
            OperatingSystem::Unsupported
        }
    }
}

fn parse_os_release(content: &str) -> OperatingSystem {
    if content.contains("openEuler") {
        OperatingSystem::OpenEuler
    } else if content.contains("Ubuntu") {
        OperatingSystem::Ubuntu
    } else {
        warn!("Could not detect operating system in {}!", content);
        OperatingSystem::Unsupported
    }
}

/// Container image matching the host OS.
pub fn default_image(os: OperatingSystem) -> &'static str {
    match os {
        OperatingSystem::OpenEuler => "hub.oepkgs.net/openeuler/openeuler",
        OperatingSystem::Ubuntu | OperatingSystem::Unsupported => "ubuntu:latest",
    }
}
