use maxminddb::geoip2;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::path::Path;

/// Country lookups backed by a MaxMind database.
pub struct MmdbReader {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MmdbReader {
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, maxminddb::MaxMindDBError> {
        let reader = maxminddb::Reader::open_readfile(path)?;
        Ok(Self { reader })
    }

    pub fn search_country(&self, ip: IpAddr) -> Option<&str> {
        let country: geoip2::Country = self.reader.lookup(ip).ok()?;
        country
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .or_else(|| country.registered_country.as_ref().and_then(|c| c.iso_code))
    }
}

impl Debug for MmdbReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("MMDB")
    }
}

/// Private, loopback and link-local ranges, reported as country `LAN`.
pub fn is_lan(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (seg & 0xfe00) == 0xfc00
                || (seg & 0xffc0) == 0xfe80
        }
    }
}

#[test]
fn test_is_lan() {
    assert!(is_lan("192.168.1.1".parse().unwrap()));
    assert!(is_lan("10.2.3.4".parse().unwrap()));
    assert!(is_lan("127.0.0.1".parse().unwrap()));
    assert!(is_lan("fd00::1".parse().unwrap()));
    assert!(is_lan("fe80::1".parse().unwrap()));
    assert!(!is_lan("8.8.8.8".parse().unwrap()));
    assert!(!is_lan("2001:4860::8888".parse().unwrap()));
}
