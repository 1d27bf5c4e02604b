//! JS sources of the builtin modules.
//!
//! Each source evaluates to `function (host, internal, require, module)`,
//! which fills `module.exports`.

static BUILTINS: [(&str, &str); 15] = [
    ("assert", include_str!("../js/assert.js")),
    ("buffer", include_str!("../js/buffer.js")),
    ("crypto", include_str!("../js/crypto.js")),
    ("events", include_str!("../js/events.js")),
    ("fs", include_str!("../js/fs.js")),
    ("http", include_str!("../js/http.js")),
    ("https", include_str!("../js/https.js")),
    ("net", include_str!("../js/net.js")),
    ("os", include_str!("../js/os.js")),
    ("path", include_str!("../js/path.js")),
    ("querystring", include_str!("../js/querystring.js")),
    ("stream", include_str!("../js/stream.js")),
    ("url", include_str!("../js/url.js")),
    ("util", include_str!("../js/util.js")),
    ("zlib", include_str!("../js/zlib.js")),
];

pub fn builtin_source(name: &str) -> Option<&'static str> {
    BUILTINS
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(_, source)| *source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::BUILTIN_MODULES;

    #[test]
    fn test_every_builtin_has_a_source() {
        for name in BUILTIN_MODULES {
            let source = builtin_source(name).unwrap_or_else(|| panic!("missing {name}"));
            assert!(source.trim_start().starts_with("(function"), "{name}");
        }
        assert!(builtin_source("child_process").is_none());
    }
}
