//! CSR intake checks for order finalization.

use std::net::IpAddr;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::errors::{self, Error};
use crate::identifier::{normalize_identifiers, AcmeIdentifier};

/// Verifies a finalization CSR: parseable, self-signed by its inner key, an
/// acceptable public key, no extension requests beyond subjectAltName, and a
/// name set exactly equal to the order's identifier set. Returns the checked
/// public key for the blocked-key lookup.
pub fn verify_csr(
    der: &[u8],
    order_idents: &[AcmeIdentifier],
) -> errors::Result<openssl::pkey::PKey<openssl::pkey::Public>> {
    let (rest, csr) = x509_parser::certification_request::X509CertificationRequest::from_der(der)
        .map_err(|_| Error::bad_csr("CSR could not be parsed"))?;
    if !rest.is_empty() {
        return Err(Error::bad_csr("CSR has trailing bytes"));
    }

    csr.verify_signature()
        .map_err(|_| Error::bad_csr("CSR not signed by its public key"))?;

    let spki = csr.certification_request_info.subject_pki.raw;
    let public_key = openssl::pkey::PKey::public_key_from_der(spki)
        .map_err(|_| Error::bad_public_key("CSR contains an unparseable public key"))?;
    crate::goodkey::check_public_key(&public_key)?;

    let mut csr_idents = vec![];
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            match extension {
                ParsedExtension::SubjectAlternativeName(san) => {
                    for name in &san.general_names {
                        match name {
                            GeneralName::DNSName(dns) => {
                                csr_idents.push(AcmeIdentifier::dns(dns));
                            }
                            GeneralName::IPAddress(bytes) => {
                                let addr = ip_from_san_bytes(bytes)?;
                                csr_idents.push(AcmeIdentifier::ip(&addr.to_string()));
                            }
                            _ => {
                                return Err(Error::bad_csr(
                                    "CSR contains an unsupported subjectAltName type",
                                ));
                            }
                        }
                    }
                }
                _ => return Err(Error::bad_csr("CSR contains a disallowed extension request")),
            }
        }
    }

    // A CN is tolerated, but only when it repeats one of the SANs.
    for cn in csr.certification_request_info.subject.iter_common_name() {
        let cn = cn.as_str().map_err(|_| Error::bad_csr("CSR has an unparseable common name"))?;
        let cn = AcmeIdentifier::dns(cn).normalize();
        if !csr_idents.iter().any(|i| i.normalize() == cn) {
            return Err(Error::bad_csr("CSR common name is not among its subjectAltNames"));
        }
    }

    let csr_idents = normalize_identifiers(&csr_idents);
    let order_idents = normalize_identifiers(order_idents);
    if csr_idents != order_idents {
        return Err(Error::bad_csr(
            "CSR does not specify the same identifiers as the order",
        ));
    }
    Ok(public_key)
}

fn ip_from_san_bytes(bytes: &[u8]) -> errors::Result<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into()
                .map_err(|_| Error::bad_csr("CSR contains an invalid IP subjectAltName"))?;
            Ok(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into()
                .map_err(|_| Error::bad_csr("CSR contains an invalid IP subjectAltName"))?;
            Ok(IpAddr::from(octets))
        }
        _ => Err(Error::bad_csr("CSR contains an invalid IP subjectAltName")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn make_csr(sans: &[&str], cn: Option<&str>) -> Vec<u8> {
        let group = openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
        let key = openssl::pkey::PKey::from_ec_key(openssl::ec::EcKey::generate(&group).unwrap()).unwrap();

        let mut builder = openssl::x509::X509ReqBuilder::new().unwrap();
        builder.set_pubkey(&key).unwrap();

        if let Some(cn) = cn {
            let mut name = openssl::x509::X509NameBuilder::new().unwrap();
            name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, cn).unwrap();
            builder.set_subject_name(&name.build()).unwrap();
        }

        if !sans.is_empty() {
            let mut san = openssl::x509::extension::SubjectAlternativeName::new();
            for value in sans {
                match value.parse::<IpAddr>() {
                    Ok(_) => san.ip(value),
                    Err(_) => san.dns(value),
                };
            }
            let context = builder.x509v3_context(None);
            let san = san.build(&context).unwrap();
            let mut extensions = openssl::stack::Stack::new().unwrap();
            extensions.push(san).unwrap();
            builder.add_extensions(&extensions).unwrap();
        }

        builder.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();
        builder.build().to_der().unwrap()
    }

    #[test]
    fn accepts_matching_san_set() {
        let der = make_csr(&["example.com", "www.example.com"], Some("example.com"));
        let order = [
            AcmeIdentifier::dns("www.example.com"),
            AcmeIdentifier::dns("example.com"),
        ];
        assert!(verify_csr(&der, &order).is_ok());
    }

    #[test]
    fn accepts_wildcard_and_ip_sans() {
        let der = make_csr(&["*.example.com"], None);
        assert!(verify_csr(&der, &[AcmeIdentifier::dns("*.example.com")]).is_ok());

        let der = make_csr(&["93.184.216.34"], None);
        assert!(verify_csr(&der, &[AcmeIdentifier::ip("93.184.216.34")]).is_ok());
    }

    #[test]
    fn rejects_name_set_mismatch() {
        let der = make_csr(&["example.com", "sneaky.example.org"], None);
        let err = verify_csr(&der, &[AcmeIdentifier::dns("example.com")]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadCsr);

        let der = make_csr(&["example.com"], None);
        let order = [
            AcmeIdentifier::dns("example.com"),
            AcmeIdentifier::dns("www.example.com"),
        ];
        assert_eq!(verify_csr(&der, &order).unwrap_err().kind, ErrorKind::BadCsr);
    }

    #[test]
    fn name_comparison_is_case_insensitive() {
        let der = make_csr(&["EXAMPLE.com"], None);
        assert!(verify_csr(&der, &[AcmeIdentifier::dns("example.com")]).is_ok());
    }

    #[test]
    fn rejects_cn_not_in_sans() {
        let der = make_csr(&["example.com"], Some("other.example.com"));
        assert_eq!(
            verify_csr(&der, &[AcmeIdentifier::dns("example.com")]).unwrap_err().kind,
            ErrorKind::BadCsr
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            verify_csr(b"not a csr", &[AcmeIdentifier::dns("example.com")]).unwrap_err().kind,
            ErrorKind::BadCsr
        );
    }
}
