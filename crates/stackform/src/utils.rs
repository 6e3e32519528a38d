//! Utilities for working with `stackform`.

fn sha256<R: std::io::Read>(mut reader: R) -> std::io::Result<ring::digest::Digest> {
    let mut context = ring::digest::Context::new(&ring::digest::SHA256);
    let mut buffer = [0; 1024];

    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        context.update(&buffer[..count]);
    }

    Ok(context.finish())
}

/// Returns the uppercase hex sha256 digest of the file at the given path
/// *if it exists*. If the file does _not_ exist it returns `Ok(None)`.
pub fn sha256_digest(path: impl AsRef<std::path::Path>) -> anyhow::Result<Option<String>> {
    log::trace!("determining sha256 of {}", path.as_ref().display());
    if !path.as_ref().exists() {
        return Ok(None);
    }

    let input = std::fs::File::open(path)?;
    let digest = sha256(std::io::BufReader::new(input))?;
    Ok(Some(data_encoding::HEXUPPER.encode(digest.as_ref())))
}

/// Lowercase hex sha256 of some bytes.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes.as_ref());
    data_encoding::HEXLOWER.encode(digest.as_ref())
}

#[cfg(test)]
mod test {
    #[test]
    fn digest_of_missing_file_is_none() {
        let path = std::env::temp_dir().join("stackform-utils-definitely-missing.zip");
        assert_eq!(None, super::sha256_digest(path).unwrap());
    }

    #[test]
    fn hex_digest_is_lowercase_sha256() {
        assert_eq!(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            super::sha256_hex("")
        );
    }
}
