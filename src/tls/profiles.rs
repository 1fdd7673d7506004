//! TLS fingerprint profiles and selection policy.
//!
//! Fixed profiles parrot specific browser versions; the randomized profile
//! derives a plausible fingerprint deterministically from a seed. Custom
//! profiles supplied through `TlsParameters` are treated as explicitly
//! enabled: limit lists do not filter them, disable lists do.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::client_hello::{ExtensionId, HelloShape, GREASE_PLACEHOLDER, GROUP_X25519};

pub const TLS_PROFILE_IOS_111: &str = "iOS-11.1";
pub const TLS_PROFILE_IOS_121: &str = "iOS-12.1";
pub const TLS_PROFILE_CHROME_58: &str = "Chrome-58";
pub const TLS_PROFILE_CHROME_62: &str = "Chrome-62";
pub const TLS_PROFILE_CHROME_70: &str = "Chrome-70";
pub const TLS_PROFILE_CHROME_83: &str = "Chrome-83";
pub const TLS_PROFILE_FIREFOX_55: &str = "Firefox-55";
pub const TLS_PROFILE_FIREFOX_65: &str = "Firefox-65";
pub const TLS_PROFILE_RANDOMIZED: &str = "Randomized-v2";

pub const SUPPORTED_TLS_PROFILES: &[&str] = &[
    TLS_PROFILE_IOS_111,
    TLS_PROFILE_IOS_121,
    TLS_PROFILE_CHROME_58,
    TLS_PROFILE_CHROME_62,
    TLS_PROFILE_CHROME_70,
    TLS_PROFILE_CHROME_83,
    TLS_PROFILE_FIREFOX_55,
    TLS_PROFILE_FIREFOX_65,
    TLS_PROFILE_RANDOMIZED,
];

pub fn tls_profile_is_randomized(profile: &str) -> bool {
    profile == TLS_PROFILE_RANDOMIZED
}

/// TLS 1.2 profiles whose ClientHello omits the session_ticket extension.
/// Protocols that rely on (obfuscated) session tickets must not select
/// these.
pub fn tls12_profile_omits_session_tickets(profile: &str) -> bool {
    matches!(profile, TLS_PROFILE_IOS_111 | TLS_PROFILE_IOS_121)
}

pub fn tls_profile_is_tls13(profile: &str) -> bool {
    matches!(
        profile,
        TLS_PROFILE_CHROME_70 | TLS_PROFILE_CHROME_83 | TLS_PROFILE_FIREFOX_65
    )
}

/// A caller-supplied fingerprint with a stable name.
#[derive(Debug, Clone)]
pub struct CustomTlsProfile {
    pub name: String,
    pub shape: HelloShape,
}

/// Read-only TLS parameter set consumed by profile selection and the
/// dialer. The embedding application owns these values.
#[derive(Debug, Clone)]
pub struct TlsParameters {
    /// When non-empty, only these stock profiles are candidates.
    pub limit_tls_profiles: Vec<String>,
    /// Per fronting provider: profiles that must never be selected.
    pub disable_fronting_provider_tls_profiles: HashMap<String, Vec<String>>,
    pub custom_tls_profiles: Vec<CustomTlsProfile>,
    /// Drop stock profiles entirely when custom ones exist.
    pub use_only_custom_tls_profiles: bool,
    pub select_randomized_tls_profile_probability: f64,
    pub no_default_tls_session_id_probability: f64,
}

impl Default for TlsParameters {
    fn default() -> Self {
        Self {
            limit_tls_profiles: Vec::new(),
            disable_fronting_provider_tls_profiles: HashMap::new(),
            custom_tls_profiles: Vec::new(),
            use_only_custom_tls_profiles: false,
            select_randomized_tls_profile_probability: 0.25,
            no_default_tls_session_id_probability: 0.5,
        }
    }
}

impl TlsParameters {
    pub fn custom_profile(&self, name: &str) -> Option<&CustomTlsProfile> {
        self.custom_tls_profiles.iter().find(|p| p.name == name)
    }
}

/// Pick a TLS profile at random, honoring limits, per-provider disables,
/// and the randomized-versus-parrot weighting. Returns None when every
/// candidate is filtered out.
pub fn select_tls_profile(
    require_tls12_session_tickets: bool,
    is_fronted: bool,
    fronting_provider_id: &str,
    params: &TlsParameters,
) -> Option<String> {
    let disabled: &[String] = if is_fronted && !fronting_provider_id.is_empty() {
        params
            .disable_fronting_provider_tls_profiles
            .get(fronting_provider_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    } else {
        &[]
    };
    let is_disabled = |profile: &str| disabled.iter().any(|d| d == profile);

    let mut randomized_profiles: Vec<&str> = Vec::new();
    let mut parrot_profiles: Vec<&str> = Vec::new();

    for profile in &params.custom_tls_profiles {
        if !is_disabled(&profile.name) {
            parrot_profiles.push(&profile.name);
        }
    }

    let mut use_only_custom = params.use_only_custom_tls_profiles;
    if use_only_custom && parrot_profiles.is_empty() {
        use_only_custom = false;
    }

    if !use_only_custom {
        for &profile in SUPPORTED_TLS_PROFILES {
            if !params.limit_tls_profiles.is_empty()
                && !params.limit_tls_profiles.iter().any(|p| p == profile)
            {
                continue;
            }
            if is_disabled(profile) {
                continue;
            }
            // Protocols built on obfuscated session tickets need the
            // ticket extension in TLS 1.2 hellos; TLS 1.3 encrypts the
            // server certificate anyway, so 1.3 profiles stay eligible.
            if require_tls12_session_tickets
                && !tls_profile_is_tls13(profile)
                && tls12_profile_omits_session_tickets(profile)
            {
                continue;
            }
            if tls_profile_is_randomized(profile) {
                randomized_profiles.push(profile);
            } else {
                parrot_profiles.push(profile);
            }
        }
    }

    let mut rng = rand::thread_rng();

    if !randomized_profiles.is_empty()
        && (parrot_profiles.is_empty()
            || rng.gen_bool(
                params
                    .select_randomized_tls_profile_probability
                    .clamp(0.0, 1.0),
            ))
    {
        return randomized_profiles
            .choose(&mut rng)
            .map(|s| s.to_string());
    }

    parrot_profiles.choose(&mut rng).map(|s| s.to_string())
}

const CHROME_TLS12_CIPHERS: &[u16] = &[
    GREASE_PLACEHOLDER,
    0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f,
    0x0035, 0x000a,
];

const CHROME_TLS13_CIPHERS: &[u16] = &[
    GREASE_PLACEHOLDER,
    0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014,
    0x009c, 0x009d, 0x002f, 0x0035, 0x000a,
];

const FIREFOX_TLS12_CIPHERS: &[u16] = &[
    0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a, 0xc009, 0xc013, 0xc014, 0x0033,
    0x0039, 0x002f, 0x0035, 0x000a,
];

const FIREFOX_TLS13_CIPHERS: &[u16] = &[
    0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a, 0xc009,
    0xc013, 0xc014, 0x0033, 0x0039, 0x002f, 0x0035, 0x000a,
];

const IOS_CIPHERS: &[u16] = &[
    0xc02c, 0xc02b, 0xc024, 0xc023, 0xc00a, 0xc009, 0xc030, 0xc02f, 0xc028, 0xc027, 0xc014,
    0xc013, 0x009d, 0x009c, 0x003d, 0x003c, 0x0035, 0x002f,
];

const CHROME_SIGNATURE_ALGORITHMS: &[u16] = &[
    0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
];

const FIREFOX_SIGNATURE_ALGORITHMS: &[u16] = &[
    0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601, 0x0203, 0x0201,
];

const IOS_SIGNATURE_ALGORITHMS: &[u16] = &[
    0x0403, 0x0401, 0x0503, 0x0501, 0x0603, 0x0601, 0x0201,
];

fn chrome_tls13_shape(ciphers: &[u16]) -> HelloShape {
    HelloShape {
        cipher_suites: ciphers.to_vec(),
        extensions: vec![
            ExtensionId::GreaseFirst,
            ExtensionId::ServerName,
            ExtensionId::ExtendedMasterSecret,
            ExtensionId::RenegotiationInfo,
            ExtensionId::SupportedGroups,
            ExtensionId::EcPointFormats,
            ExtensionId::SessionTicket,
            ExtensionId::Alpn,
            ExtensionId::StatusRequest,
            ExtensionId::SignatureAlgorithms,
            ExtensionId::SignedCertificateTimestamp,
            ExtensionId::KeyShare,
            ExtensionId::PskKeyExchangeModes,
            ExtensionId::SupportedVersions,
            ExtensionId::GreaseLast,
            ExtensionId::Padding,
        ],
        groups: vec![GREASE_PLACEHOLDER, GROUP_X25519, 0x0017, 0x0018],
        signature_algorithms: CHROME_SIGNATURE_ALGORITHMS.to_vec(),
        alpn: vec!["h2".to_string(), "http/1.1".to_string()],
        offer_tls13: true,
        omits_session_tickets: false,
    }
}

fn chrome_tls12_shape() -> HelloShape {
    let mut shape = chrome_tls13_shape(CHROME_TLS12_CIPHERS);
    shape.extensions.retain(|e| {
        !matches!(
            e,
            ExtensionId::KeyShare | ExtensionId::PskKeyExchangeModes | ExtensionId::SupportedVersions
        )
    });
    shape.offer_tls13 = false;
    shape
}

fn firefox_shape(tls13: bool) -> HelloShape {
    HelloShape {
        cipher_suites: if tls13 {
            FIREFOX_TLS13_CIPHERS.to_vec()
        } else {
            FIREFOX_TLS12_CIPHERS.to_vec()
        },
        extensions: {
            let mut extensions = vec![
                ExtensionId::ServerName,
                ExtensionId::ExtendedMasterSecret,
                ExtensionId::RenegotiationInfo,
                ExtensionId::SupportedGroups,
                ExtensionId::EcPointFormats,
                ExtensionId::SessionTicket,
                ExtensionId::Alpn,
                ExtensionId::StatusRequest,
            ];
            if tls13 {
                extensions.push(ExtensionId::KeyShare);
                extensions.push(ExtensionId::SupportedVersions);
                extensions.push(ExtensionId::SignatureAlgorithms);
                extensions.push(ExtensionId::PskKeyExchangeModes);
                extensions.push(ExtensionId::RecordSizeLimit);
            } else {
                extensions.push(ExtensionId::SignatureAlgorithms);
            }
            extensions
        },
        groups: vec![GROUP_X25519, 0x0017, 0x0018, 0x0019, 0x0100, 0x0101],
        signature_algorithms: FIREFOX_SIGNATURE_ALGORITHMS.to_vec(),
        alpn: vec!["h2".to_string(), "http/1.1".to_string()],
        offer_tls13: tls13,
        omits_session_tickets: false,
    }
}

fn ios_shape() -> HelloShape {
    HelloShape {
        cipher_suites: IOS_CIPHERS.to_vec(),
        extensions: vec![
            ExtensionId::ServerName,
            ExtensionId::RenegotiationInfo,
            ExtensionId::SupportedGroups,
            ExtensionId::EcPointFormats,
            ExtensionId::Alpn,
            ExtensionId::StatusRequest,
            ExtensionId::SignatureAlgorithms,
            ExtensionId::SignedCertificateTimestamp,
            ExtensionId::ExtendedMasterSecret,
        ],
        groups: vec![GROUP_X25519, 0x0017, 0x0018, 0x0019],
        signature_algorithms: IOS_SIGNATURE_ALGORITHMS.to_vec(),
        alpn: vec!["h2".to_string(), "http/1.1".to_string()],
        offer_tls13: false,
        omits_session_tickets: true,
    }
}

/// Deterministically generate a plausible fingerprint from a seed: cipher
/// and extension orders are drawn from distributions consistent with real
/// browsers, so replaying the seed replays the hello.
fn randomized_shape(seed: [u8; 32]) -> HelloShape {
    let mut rng = StdRng::from_seed(seed);

    let offer_tls13 = rng.gen_bool(0.75);

    let mut cipher_pool: Vec<u16> = vec![
        0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f,
        0x0035,
    ];
    cipher_pool.shuffle(&mut rng);
    let keep = rng.gen_range(6..=cipher_pool.len());
    cipher_pool.truncate(keep);

    let mut cipher_suites = Vec::with_capacity(cipher_pool.len() + 4);
    if rng.gen_bool(0.5) {
        cipher_suites.push(GREASE_PLACEHOLDER);
    }
    if offer_tls13 {
        let mut tls13_suites = vec![0x1301, 0x1302, 0x1303];
        tls13_suites.shuffle(&mut rng);
        cipher_suites.extend_from_slice(&tls13_suites);
    }
    cipher_suites.extend_from_slice(&cipher_pool);

    // SNI first, core extensions shuffled behind it, padding last.
    let mut middle = vec![
        ExtensionId::ExtendedMasterSecret,
        ExtensionId::RenegotiationInfo,
        ExtensionId::SupportedGroups,
        ExtensionId::EcPointFormats,
        ExtensionId::SessionTicket,
        ExtensionId::Alpn,
        ExtensionId::StatusRequest,
        ExtensionId::SignatureAlgorithms,
    ];
    middle.shuffle(&mut rng);
    if offer_tls13 {
        let insert_at = rng.gen_range(0..=middle.len());
        middle.insert(insert_at, ExtensionId::KeyShare);
        let insert_at = rng.gen_range(0..=middle.len());
        middle.insert(insert_at, ExtensionId::SupportedVersions);
        let insert_at = rng.gen_range(0..=middle.len());
        middle.insert(insert_at, ExtensionId::PskKeyExchangeModes);
    }

    let mut extensions = Vec::with_capacity(middle.len() + 3);
    if rng.gen_bool(0.5) {
        extensions.push(ExtensionId::GreaseFirst);
    }
    extensions.push(ExtensionId::ServerName);
    extensions.extend_from_slice(&middle);
    if rng.gen_bool(0.5) {
        extensions.push(ExtensionId::Padding);
    }

    let mut groups = vec![GROUP_X25519, 0x0017, 0x0018];
    if rng.gen_bool(0.3) {
        groups.push(0x0019);
    }
    if rng.gen_bool(0.5) {
        groups.insert(0, GREASE_PLACEHOLDER);
    }

    HelloShape {
        cipher_suites,
        extensions,
        groups,
        signature_algorithms: CHROME_SIGNATURE_ALGORITHMS.to_vec(),
        alpn: vec!["h2".to_string(), "http/1.1".to_string()],
        offer_tls13,
        omits_session_tickets: false,
    }
}

/// Resolve a profile name to a hello shape. Randomized profiles require a
/// seed so the hello is replayable.
pub fn profile_shape(
    profile: &str,
    randomized_seed: Option<[u8; 32]>,
    params: &TlsParameters,
) -> std::io::Result<HelloShape> {
    if tls_profile_is_randomized(profile) {
        let seed = randomized_seed.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "randomized profile requires a seed",
            )
        })?;
        return Ok(randomized_shape(seed));
    }

    match profile {
        TLS_PROFILE_CHROME_58 | TLS_PROFILE_CHROME_62 => Ok(chrome_tls12_shape()),
        TLS_PROFILE_CHROME_70 | TLS_PROFILE_CHROME_83 => {
            Ok(chrome_tls13_shape(CHROME_TLS13_CIPHERS))
        }
        TLS_PROFILE_FIREFOX_55 => Ok(firefox_shape(false)),
        TLS_PROFILE_FIREFOX_65 => Ok(firefox_shape(true)),
        TLS_PROFILE_IOS_111 | TLS_PROFILE_IOS_121 => Ok(ios_shape()),
        _ => match params.custom_profile(profile) {
            Some(custom) => Ok(custom.shape.clone()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown TLS profile: {}", profile),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_respects_provider_disable_list() {
        let mut params = TlsParameters::default();
        params.disable_fronting_provider_tls_profiles.insert(
            "P".to_string(),
            vec![TLS_PROFILE_FIREFOX_65.to_string()],
        );

        for _ in 0..10_000 {
            let profile = select_tls_profile(false, true, "P", &params).unwrap();
            assert_ne!(profile, TLS_PROFILE_FIREFOX_65);
        }
        // The disable list only applies to the named provider.
        let mut seen = false;
        for _ in 0..10_000 {
            if select_tls_profile(false, true, "Q", &params).unwrap() == TLS_PROFILE_FIREFOX_65 {
                seen = true;
                break;
            }
        }
        assert!(seen);
    }

    #[test]
    fn test_select_honors_limit_list() {
        let params = TlsParameters {
            limit_tls_profiles: vec![TLS_PROFILE_CHROME_83.to_string()],
            ..Default::default()
        };
        for _ in 0..100 {
            assert_eq!(
                select_tls_profile(false, false, "", &params).unwrap(),
                TLS_PROFILE_CHROME_83
            );
        }
    }

    #[test]
    fn test_require_tls12_session_tickets_excludes_ios() {
        let params = TlsParameters::default();
        for _ in 0..10_000 {
            let profile = select_tls_profile(true, false, "", &params).unwrap();
            assert!(!tls12_profile_omits_session_tickets(&profile) || tls_profile_is_tls13(&profile));
        }
    }

    #[test]
    fn test_use_only_custom_profiles() {
        let custom = CustomTlsProfile {
            name: "Custom-1".to_string(),
            shape: chrome_tls12_shape(),
        };
        let params = TlsParameters {
            custom_tls_profiles: vec![custom],
            use_only_custom_tls_profiles: true,
            // Randomized stays eligible only via the stock list, which is
            // disabled here.
            select_randomized_tls_profile_probability: 0.0,
            ..Default::default()
        };
        for _ in 0..100 {
            assert_eq!(select_tls_profile(false, false, "", &params).unwrap(), "Custom-1");
        }
    }

    #[test]
    fn test_all_filtered_returns_none() {
        let params = TlsParameters {
            limit_tls_profiles: vec!["No-Such-Profile".to_string()],
            ..Default::default()
        };
        assert!(select_tls_profile(false, false, "", &params).is_none());
    }

    #[test]
    fn test_randomized_shape_is_deterministic() {
        let a = randomized_shape([9u8; 32]);
        let b = randomized_shape([9u8; 32]);
        assert_eq!(a.cipher_suites, b.cipher_suites);
        assert_eq!(a.extensions, b.extensions);
        let c = randomized_shape([10u8; 32]);
        // Overwhelmingly likely to differ somewhere.
        assert!(
            a.cipher_suites != c.cipher_suites
                || a.extensions != c.extensions
                || a.groups != c.groups
        );
    }

    #[test]
    fn test_profile_shape_known_profiles() {
        let params = TlsParameters::default();
        for &profile in SUPPORTED_TLS_PROFILES {
            if tls_profile_is_randomized(profile) {
                assert!(profile_shape(profile, None, &params).is_err());
                assert!(profile_shape(profile, Some([1u8; 32]), &params).is_ok());
            } else {
                let shape = profile_shape(profile, None, &params).unwrap();
                assert_eq!(shape.offer_tls13, tls_profile_is_tls13(profile));
            }
        }
        assert!(profile_shape("Netscape-4", None, &params).is_err());
    }
}
