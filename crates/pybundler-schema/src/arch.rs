//! CPU architectures a bundle can target.

/// Target CPU architecture for a bundle.
///
/// macOS runs on Apple Silicon (ARM64) and Intel (`x86_64`). A `universal2`
/// bundle carries both slices in every binary, which means every native
/// extension and library it ships must be fat as well.
///
/// # Example
///
/// ```
/// use pybundler_schema::Arch;
///
/// let arch: Arch = "universal2".parse().unwrap();
/// assert_eq!(arch.slices(), &["arm64", "x86_64"]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// ARM64 architecture (Apple Silicon)
    Arm64,
    /// `x86_64` architecture (Intel Macs)
    X86_64,
    /// Fat binaries with both an ARM64 and an `x86_64` slice
    Universal2,
}

impl Arch {
    /// Architecture of the machine running the build.
    pub fn current() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            Self::Arm64
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            Self::X86_64
        }
    }

    /// Convert to string representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arm64 => "arm64",
            Self::X86_64 => "x86_64",
            Self::Universal2 => "universal2",
        }
    }

    /// Mach-O slice names every binary in the bundle must provide.
    pub fn slices(self) -> &'static [&'static str] {
        match self {
            Self::Arm64 => &["arm64"],
            Self::X86_64 => &["x86_64"],
            Self::Universal2 => &["arm64", "x86_64"],
        }
    }

    /// Pick the architecture matching a set of slice names, if any.
    ///
    /// Used to derive the bundle architecture from the interpreter binary
    /// when the configuration leaves it open.
    pub fn from_slices<'a>(slices: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let (mut arm, mut intel) = (false, false);
        for slice in slices {
            match slice {
                "arm64" | "arm64e" => arm = true,
                "x86_64" | "x86_64h" => intel = true,
                _ => {}
            }
        }
        match (arm, intel) {
            (true, true) => Some(Self::Universal2),
            (true, false) => Some(Self::Arm64),
            (false, true) => Some(Self::X86_64),
            (false, false) => None,
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "x86_64" | "amd64" | "intel" => Ok(Self::X86_64),
            "universal2" | "universal" | "fat" => Ok(Self::Universal2),
            _ => Err(format!("Unknown architecture: {s}")),
        }
    }
}
