//! Public key acceptance policy for CSRs.

use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKeyRef};

use crate::errors::{self, Error};

const ACCEPTABLE_RSA_SIZES: [u32; 3] = [2048, 3072, 4096];

/// Checks a subscriber public key against the key policy: RSA moduli of an
/// acceptable size with exponent 65537, or ECDSA keys on P-256 or P-384.
pub fn check_public_key<T: HasPublic>(pkey: &PKeyRef<T>) -> errors::Result<()> {
    match pkey.id() {
        openssl::pkey::Id::RSA => {
            let rsa = pkey.rsa()
                .map_err(|_| Error::bad_public_key("unparseable RSA public key"))?;
            let bits = rsa.size() * 8;
            if !ACCEPTABLE_RSA_SIZES.contains(&bits) {
                return Err(Error::bad_public_key(format!(
                    "key size not supported: {} bits", bits
                )));
            }
            let e = rsa.e().to_owned()
                .map_err(|_| Error::bad_public_key("unparseable RSA exponent"))?;
            let f4 = openssl::bn::BigNum::from_u32(65537)
                .map_err(|e| Error::internal(format!("failed to make exponent: {}", e)))?;
            if e != f4 {
                return Err(Error::bad_public_key("RSA public exponent must be 65537"));
            }
            Ok(())
        }
        openssl::pkey::Id::EC => {
            let ec = pkey.ec_key()
                .map_err(|_| Error::bad_public_key("unparseable ECDSA public key"))?;
            match ec.group().curve_name() {
                Some(Nid::X9_62_PRIME256V1) | Some(Nid::SECP384R1) => Ok(()),
                _ => Err(Error::bad_public_key("ECDSA curve not supported")),
            }
        }
        _ => Err(Error::bad_public_key("unsupported public key type")),
    }
}

/// SHA-256 over the DER encoded SubjectPublicKeyInfo, the digest recorded in
/// the blocked keys table.
pub fn spki_sha256<T: HasPublic>(pkey: &PKeyRef<T>) -> errors::Result<Vec<u8>> {
    let spki = pkey.public_key_to_der()
        .map_err(|e| Error::internal(format!("failed to encode SPKI: {}", e)))?;
    Ok(openssl::sha::sha256(&spki).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_p256_and_rejects_small_rsa() {
        let group = openssl::ec::EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let ec = openssl::ec::EcKey::generate(&group).unwrap();
        let pkey = openssl::pkey::PKey::from_ec_key(ec).unwrap();
        assert!(check_public_key(&pkey).is_ok());

        let rsa = openssl::rsa::Rsa::generate(1024).unwrap();
        let pkey = openssl::pkey::PKey::from_rsa(rsa).unwrap();
        assert!(check_public_key(&pkey).is_err());
    }

    #[test]
    fn accepts_rsa_2048() {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let pkey = openssl::pkey::PKey::from_rsa(rsa).unwrap();
        assert!(check_public_key(&pkey).is_ok());
    }

    #[test]
    fn spki_digest_is_stable() {
        let group = openssl::ec::EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let ec = openssl::ec::EcKey::generate(&group).unwrap();
        let pkey = openssl::pkey::PKey::from_ec_key(ec).unwrap();
        assert_eq!(spki_sha256(&pkey).unwrap(), spki_sha256(&pkey).unwrap());
        assert_eq!(spki_sha256(&pkey).unwrap().len(), 32);
    }
}
