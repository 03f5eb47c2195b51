use crate::prelude::*;
use ring::digest;

// Checksums identify the source state an entry was built from; they are a
// change detector, not an integrity guarantee. The registry is keyed by the
// lowercase names configuration files use.

#[derive(Copy, Clone)]
pub struct Algorithm {
    name: &'static str,
    digest: &'static digest::Algorithm,
}

pub static SHA256: Algorithm = Algorithm {
    name: "sha256",
    digest: &digest::SHA256,
};

static REGISTRY: Lazy<Vec<Algorithm>> = Lazy::new(|| {
    vec![
        Algorithm {
            name: "sha1",
            digest: &digest::SHA1_FOR_LEGACY_USE_ONLY,
        },
        SHA256,
        Algorithm {
            name: "sha384",
            digest: &digest::SHA384,
        },
        Algorithm {
            name: "sha512",
            digest: &digest::SHA512,
        },
        Algorithm {
            name: "sha512-256",
            digest: &digest::SHA512_256,
        },
    ]
});

pub fn available() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|a| a.name)
}

pub fn lookup(name: &str) -> Result<Algorithm> {
    let name = name.to_lowercase();
    REGISTRY
        .iter()
        .find(|a| a.name == name)
        .copied()
        .ok_or_else(|| eyre!("unknown checksum algorithm: {name:?}"))
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn hasher(&self) -> Hasher {
        Hasher {
            ctx: digest::Context::new(self.digest),
        }
    }
}

impl std::fmt::Debug for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Algorithm({})", self.name)
    }
}

pub struct Hasher {
    ctx: digest::Context,
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        self.ctx.update(data);
    }

    pub fn finish(self) -> Vec<u8> {
        self.ctx.finish().as_ref().to_vec()
    }
}
