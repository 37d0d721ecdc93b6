//! Name conversion, archive keys and digests

use sha2::{Digest, Sha256};

/// Extension given to workfiles that have none
pub const EMPTY_EXTENSION: &str = ".___";
/// Archive extension used for workfiles whose extension is literally `.___`
pub const EMPTY_EXTENSION_ARCHIVE: &str = ".___qvcsArchive";

pub const CEMETERY_ARCHIVE_PREFIX: &str = "QVCS_CEMETERY_ARCHIVE";
pub const CEMETERY_ARCHIVE_SUFFIX: &str = ".QVCS_ARCHIVE";

/// Appended path of the synthetic cemetery directory
pub const CEMETERY_APPENDED_PATH: &str = ".qvcsCemetery";

/// Characters left untouched when shifting an extension
const FIXED_EXTENSION_CHARS: &[char] = &[',', '?', '*', '_', '^', '~', '!', '-', '{', '}', '(', ')', '+', '\''];

/// Strip everything up to the last `/` or `\`.
pub fn short_name(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

fn shift_extension(extension: &str, forward: bool) -> String {
    extension
        .chars()
        .map(|c| {
            if FIXED_EXTENSION_CHARS.contains(&c) {
                return c;
            }
            match (forward, c) {
                (true, 'z') => 'a',
                (true, 'Z') => 'A',
                (true, '9') => '0',
                (false, 'a') => 'z',
                (false, 'A') => 'Z',
                (false, '0') => '9',
                (true, c) => char::from_u32(c as u32 + 1).unwrap_or(c),
                (false, c) => char::from_u32((c as u32).wrapping_sub(1)).unwrap_or(c),
            }
        })
        .collect()
}

/// Short archive name for a workfile: each extension character moves one
/// step forward (`z`, `Z` and `9` wrap); a name with no extension gains
/// `.___`.
pub fn workfile_to_archive_name(workfile: &str) -> String {
    let name = short_name(workfile);
    match name.rfind('.') {
        None => format!("{}{}", name, EMPTY_EXTENSION),
        Some(dot) => {
            let (stem, extension) = name.split_at(dot);
            if extension == EMPTY_EXTENSION {
                format!("{}{}", stem, EMPTY_EXTENSION_ARCHIVE)
            } else {
                format!("{}.{}", stem, shift_extension(&extension[1..], true))
            }
        }
    }
}

/// Reverse of [`workfile_to_archive_name`]
pub fn archive_to_workfile_name(archive: &str) -> String {
    let name = short_name(archive);
    match name.rfind('.') {
        None => name.to_string(),
        Some(dot) => {
            let (stem, extension) = name.split_at(dot);
            if extension == EMPTY_EXTENSION {
                stem.to_string()
            } else if extension == EMPTY_EXTENSION_ARCHIVE {
                format!("{}{}", stem, EMPTY_EXTENSION)
            } else {
                format!("{}.{}", stem, shift_extension(&extension[1..], false))
            }
        }
    }
}

/// Key used for per-directory archive maps
pub fn archive_key(short_workfile_name: &str, ignore_case: bool) -> String {
    if ignore_case {
        short_workfile_name.to_lowercase()
    } else {
        short_workfile_name.to_string()
    }
}

pub fn cemetery_archive_name(file_id: i32) -> String {
    format!("{}{}{}", CEMETERY_ARCHIVE_PREFIX, file_id, CEMETERY_ARCHIVE_SUFFIX)
}

/// File id encoded in a cemetery archive name
pub fn file_id_from_cemetery_name(name: &str) -> Option<i32> {
    short_name(name)
        .strip_prefix(CEMETERY_ARCHIVE_PREFIX)?
        .strip_suffix(CEMETERY_ARCHIVE_SUFFIX)?
        .parse()
        .ok()
}

/// Lower-case hex SHA-256 of `data`
pub fn digest_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Normalize an appended path to `/` separators without leading or
/// trailing separators.
pub fn standard_path(appended_path: &str) -> String {
    appended_path.replace('\\', "/").trim_matches('/').to_string()
}
