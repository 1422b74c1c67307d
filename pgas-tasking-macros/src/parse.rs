use proc_macro2::{Span, TokenStream};
use syn::Attribute;

pub(crate) fn parse_usize(lit: &syn::Lit, span: Span, field: &str) -> Result<usize, syn::Error> {
    let syn::Lit::Int(int) = lit else {
        return Err(syn::Error::new(span, format!("`{field}` expects an integer literal.")));
    };

    int.base10_parse::<usize>()
        .map_err(|e| syn::Error::new(span, format!("`{field}` is not a valid count: {e}")))
}

pub(crate) fn parse_bool(lit: &syn::Lit, span: Span, field: &str) -> Result<bool, syn::Error> {
    match lit {
        syn::Lit::Bool(b) => Ok(b.value),
        _ => Err(syn::Error::new(span, format!("`{field}` expects `true` or `false`."))),
    }
}

/// Matches `#[test]` and the fully qualified prelude paths.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };

    if path.segments.iter().any(|s| !s.arguments.is_none()) {
        return false;
    }

    let idents = path
        .segments
        .iter()
        .map(|s| s.ident.to_string())
        .collect::<Vec<_>>();

    match idents.as_slice() {
        [test] => path.leading_colon.is_none() && test == "test",
        [root, prelude, _, test] => {
            (root == "core" || root == "std") && prelude == "prelude" && test == "test"
        }
        _ => false,
    }
}

/// Appends `error` to `tokens`, so the item still expands next to the
/// diagnostic.
pub(crate) fn with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
