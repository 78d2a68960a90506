/// File name the interpreter sources include to get the redirection.
pub const WRAPPER_HEADER_NAME: &str = "stdlibrary_wrapper.h";

/// (host primitive, mediated replacement) pairs.
pub const REDIRECTED_SYMBOLS: &[(&str, &str)] = &[
    ("fwrite", "fwrite_sandbox"),
    ("system", "system_sandbox"),
];

/// C declarations of everything `ffi` exports.
const PROTOTYPES: &[&str] = &[
    "size_t fwrite_sandbox(const void *buffer, size_t size, size_t count, FILE *stream);",
    "int system_sandbox(const char *command);",
    "int stdlib_sandbox_init(const char *config_path);",
    "int stdlib_sandbox_init_from_env(void);",
];

const GUARD: &str = "STDLIBRARY_WRAPPER_H_";

/// Renders the header that redirects the host primitives to the mediated
/// exports. The real declarations are pulled in first so the macros only
/// rewrite the interpreter's own call sites.
pub fn render_wrapper_header() -> String {
    let mut out = String::new();
    out.push_str(&format!("#ifndef {GUARD}\n#define {GUARD}\n\n"));
    out.push_str("#include <stdio.h>\n#include <stdlib.h>\n\n");

    out.push_str("#ifdef __cplusplus\nextern \"C\" {\n#endif\n\n");
    for prototype in PROTOTYPES {
        out.push_str(prototype);
        out.push('\n');
    }
    out.push_str("\n#ifdef __cplusplus\n}\n#endif\n\n");

    for (original, mediated) in REDIRECTED_SYMBOLS {
        out.push_str(&format!("#define {original} {mediated}\n"));
    }

    out.push_str(&format!("\n#endif // {GUARD}\n"));
    out
}

/// Mediated name for a host primitive, if it is redirected.
pub fn mediated_name(original: &str) -> Option<&'static str> {
    REDIRECTED_SYMBOLS
        .iter()
        .find(|(name, _)| *name == original)
        .map(|(_, mediated)| *mediated)
}
