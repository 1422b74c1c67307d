//! Expansion of `#[pgas_tasking::test]`.
use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::ItemFn;
use syn::parse::Parser;
use syn::spanned::Spanned;

use crate::parse::{is_test_attribute, parse_bool, parse_usize, with_error};

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const MACRO_NAME: &str = "pgas_tasking::test";

const KNOWN_OPTIONS: &str = "`worker_threads`, `pool_capacity`, `stack_size`, `phase_gating`";

/// For an input like:
///
/// ```rust,no_run
/// #[pgas_tasking::test(worker_threads = 2)]
/// fn chain() {
///     pgas_tasking::create_task(|| Ok(()), &[]).unwrap();
/// }
/// ```
///
/// `args` holds `worker_threads = 2` and `item` the function. The body is
/// moved into a closure so `return` and `?` keep their meaning.
pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    // On error, still expand to something close to the expected output so
    // IDE completions keep working.
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args))
    };

    match config {
        Ok(config) => expand(input, config),
        Err(e) => with_error(expand(input, Config::default()), e),
    }
}

#[derive(Default)]
struct Config {
    worker_threads: Option<usize>,
    pool_capacity: Option<usize>,
    stack_size: Option<usize>,
    phase_gating: Option<bool>,
}

impl Config {
    fn set_usize(
        slot: &mut Option<usize>,
        lit: &syn::Lit,
        span: Span,
        field: &str,
    ) -> Result<(), syn::Error> {
        if slot.is_some() {
            return Err(syn::Error::new(span, format!("`{field}` set multiple times.")));
        }

        let value = parse_usize(lit, span, field)?;
        if value == 0 {
            return Err(syn::Error::new(span, format!("`{field}` may not be 0.")));
        }

        *slot = Some(value);
        Ok(())
    }

    fn set_phase_gating(&mut self, lit: &syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.phase_gating.is_some() {
            return Err(syn::Error::new(span, "`phase_gating` set multiple times."));
        }

        self.phase_gating = Some(parse_bool(lit, span, "phase_gating")?);
        Ok(())
    }
}

fn build_config(input: &ItemFn, args: AttributeArgs) -> Result<Config, syn::Error> {
    if let Some(asyncness) = input.sig.asyncness {
        let msg = "tasks are not futures, remove the `async` keyword";
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    if !input.sig.inputs.is_empty() {
        let msg = "the test function cannot accept arguments";
        return Err(syn::Error::new_spanned(&input.sig.inputs, msg));
    }

    let mut config = Config::default();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();

                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                let span = lit.span();

                match ident.as_str() {
                    "worker_threads" => {
                        Config::set_usize(&mut config.worker_threads, lit, span, "worker_threads")?
                    }
                    "pool_capacity" => {
                        Config::set_usize(&mut config.pool_capacity, lit, span, "pool_capacity")?
                    }
                    "stack_size" => {
                        Config::set_usize(&mut config.stack_size, lit, span, "stack_size")?
                    }
                    "phase_gating" => config.set_phase_gating(lit, span)?,
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected one of: {KNOWN_OPTIONS}"
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();

                let msg = match name.as_str() {
                    "worker_threads" | "pool_capacity" | "stack_size" | "phase_gating" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    "flavor" | "multi_thread" | "current_thread" => {
                        format!("`#[{MACRO_NAME}]` always runs a work-stealing pool, set `worker_threads` instead.")
                    }
                    name => format!(
                        "Unknown attribute {name} is specified; expected one of: {KNOWN_OPTIONS}"
                    ),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    Ok(config)
}

fn expand(input: ItemFn, config: Config) -> TokenStream {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;

    // A type mismatch is reported on the last statement.
    let last_stmt_span = block
        .stmts
        .last()
        .map_or_else(Span::call_site, |stmt| stmt.span());

    let mut rt = quote_spanned! {last_stmt_span=>
        pgas_tasking::Runtime::builder()
    };

    if let Some(v) = config.worker_threads {
        rt = quote_spanned! {last_stmt_span=> #rt.worker_threads(#v) };
    }
    if let Some(v) = config.pool_capacity {
        rt = quote_spanned! {last_stmt_span=> #rt.pool_capacity(#v) };
    }
    if let Some(v) = config.stack_size {
        rt = quote_spanned! {last_stmt_span=> #rt.stack_size(#v) };
    }
    if let Some(v) = config.phase_gating {
        rt = quote_spanned! {last_stmt_span=> #rt.phase_gating(#v) };
    }

    let output_type = match &sig.output {
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
    };

    // Inner attributes cannot stay on the generated block, lift them.
    let attrs = attrs.into_iter().map(|mut attr| {
        attr.style = syn::AttrStyle::Outer;
        attr
    });

    let body = quote_spanned! {last_stmt_span=>
        #[allow(clippy::expect_used)]
        let runtime = #rt
            .try_build()
            .expect("Failed building the Runtime");

        let body = || -> #output_type #block;
        let result = body();

        let drained = pgas_tasking::task_complete();
        runtime.fini();

        if let Err(e) = drained {
            panic!("Failed draining tasks: {e}");
        }
        result
    };

    quote! {
        #(#attrs)*
        #[::core::prelude::v1::test]
        #vis #sig {
            #body
        }
    }
}
