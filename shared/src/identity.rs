use md5::{Digest, Md5};
use uuid::Uuid;

/// Derives the identity an offline-mode server assigns to `name`.
///
/// MD5 of `OfflinePlayer:<name>` with the version nibble forced to 3 and the
/// RFC 4122 variant bits set, matching what the real server computes.
pub fn offline_uuid(name: &str) -> Uuid {
    let digest = Md5::digest(format!("OfflinePlayer:{}", name).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);

    bytes[6] = (bytes[6] & 0x0F) | 0x30;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;

    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_uuid_is_deterministic() {
        assert_eq!(offline_uuid("Alice"), offline_uuid("Alice"));
        assert_ne!(offline_uuid("Alice"), offline_uuid("alice"));
    }

    #[test]
    fn test_offline_uuid_version_and_variant_bits() {
        for name in ["Alice", "Notch", "", "a_very_long_name"] {
            let bytes = *offline_uuid(name).as_bytes();
            assert_eq!(bytes[6] >> 4, 3, "version nibble for {:?}", name);
            assert_eq!(bytes[8] >> 6, 0b10, "variant bits for {:?}", name);
        }
    }

    #[test]
    fn test_offline_uuid_matches_md5_name_based_uuid() {
        // Same construction as java.util.UUID.nameUUIDFromBytes
        let digest = Md5::digest(b"OfflinePlayer:Alice");
        let uuid = offline_uuid("Alice");
        let bytes = uuid.as_bytes();

        for i in 0..16 {
            match i {
                6 => assert_eq!(bytes[i] & 0x0F, digest[i] & 0x0F),
                8 => assert_eq!(bytes[i] & 0x3F, digest[i] & 0x3F),
                _ => assert_eq!(bytes[i], digest[i]),
            }
        }
        assert_eq!(uuid.get_version_num(), 3);
    }
}
