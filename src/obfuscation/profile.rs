//! Browser profiles for the disguise handshakes
//!
//! A profile decides the `User-Agent` of the HTTP request preamble and the
//! shape (cipher suites, groups, ALPN) of the fake TLS ClientHello, so both
//! disguises resemble what a real browser would put on the wire.

use super::random_bytes;

/// Browser fingerprint profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserProfile {
    /// Chrome 120+ on Windows/Mac/Linux
    #[default]
    Chrome,
    /// Firefox 121+ on Windows/Mac/Linux
    Firefox,
    /// Safari 17+ on macOS
    Safari,
    /// Microsoft Edge (Chromium-based)
    Edge,
    /// Random selection from profiles
    Random,
    /// iOS Safari
    IosSafari,
    /// Android Chrome
    AndroidChrome,
}

/// ClientHello fields that vary between browsers
#[derive(Debug, Clone, Copy)]
pub struct HelloShape {
    pub cipher_suites: &'static [u16],
    pub groups: &'static [u16],
    pub point_formats: &'static [u8],
    pub alpn: &'static [&'static [u8]],
}

const CHROME_HELLO: HelloShape = HelloShape {
    cipher_suites: &[
        0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8,
    ],
    groups: &[0x001d, 0x0017, 0x0018],
    point_formats: &[0x00],
    alpn: &[b"h2", b"http/1.1"],
};

const FIREFOX_HELLO: HelloShape = HelloShape {
    cipher_suites: &[
        0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030,
    ],
    groups: &[0x001d, 0x0017, 0x0018, 0x0019],
    point_formats: &[0x00],
    alpn: &[b"h2", b"http/1.1"],
};

const SAFARI_HELLO: HelloShape = HelloShape {
    cipher_suites: &[
        0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xc030, 0xc02f, 0xcca9, 0xcca8,
    ],
    groups: &[0x001d, 0x0017, 0x0018],
    point_formats: &[0x00],
    alpn: &[b"h2", b"http/1.1"],
};

impl BrowserProfile {
    /// Get a random profile
    pub fn random() -> Self {
        let mut buf = [0u8; 1];
        random_bytes(&mut buf);
        match buf[0] % 4 {
            0 => Self::Chrome,
            1 => Self::Firefox,
            2 => Self::Safari,
            _ => Self::Edge,
        }
    }

    /// Parse a profile name; unknown names fall back to Chrome
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "chrome" => Self::Chrome,
            "firefox" => Self::Firefox,
            "safari" => Self::Safari,
            "edge" => Self::Edge,
            "random" => Self::Random,
            "ios" | "ios_safari" => Self::IosSafari,
            "android" | "android_chrome" => Self::AndroidChrome,
            _ => Self::Chrome,
        }
    }

    /// Resolve `Random` to a concrete profile
    pub fn resolve(self) -> Self {
        match self {
            Self::Random => Self::random(),
            p => p,
        }
    }

    /// Get the User-Agent string for this profile
    pub fn user_agent(&self) -> &'static str {
        match self {
            Self::Chrome | Self::Edge => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            }
            Self::Firefox => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0"
            }
            Self::Safari => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15"
            }
            Self::IosSafari => {
                "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1"
            }
            Self::AndroidChrome => {
                "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36"
            }
            Self::Random => Self::random().user_agent(),
        }
    }

    /// ClientHello shape for this profile
    pub fn hello_shape(&self) -> HelloShape {
        match self {
            Self::Chrome | Self::Edge | Self::AndroidChrome => CHROME_HELLO,
            Self::Firefox => FIREFOX_HELLO,
            Self::Safari | Self::IosSafari => SAFARI_HELLO,
            Self::Random => Self::random().hello_shape(),
        }
    }
}
