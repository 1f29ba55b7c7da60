//! `#[timeout]` and `#[tokio_timeout_test]` run the test body on a watchdog
//! thread and fail it once the deadline passes. The default deadline is 60
//! seconds, an integer argument overrides it, and the `TEST_TIMEOUT_SECS`
//! environment variable overrides both at run time.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// Plain `fn` test executed directly on the watchdog thread.
    Blocking,
    /// `async fn` test driven by a current-thread Tokio runtime.
    Tokio,
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(Flavor::Blocking, attr.into(), item.into())
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(Flavor::Tokio, attr.into(), item.into())
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(flavor: Flavor, attr: TokenStream2, item: TokenStream2) -> syn::Result<TokenStream2> {
    let secs = parse_timeout(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = syn::parse2::<ItemFn>(item)?;

    match (flavor, sig.asyncness.is_some()) {
        (Flavor::Blocking, true) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "#[timeout] expects a synchronous test; use #[tokio_timeout_test] for async",
            ))
        }
        (Flavor::Tokio, false) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "#[tokio_timeout_test] expects an async test function",
            ))
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let body = match flavor {
        Flavor::Blocking => quote! { #block },
        Flavor::Tokio => quote! {{
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(__deadline, async move #block)
                    .await
                    .expect("test timed out");
            });
        }},
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __deadline = ::std::env::var("TEST_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(::std::time::Duration::from_secs)
                .unwrap_or(::std::time::Duration::from_secs(#secs));
            let (__report, __outcome) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| #body));
                let _ = __report.send(result);
            });
            match __outcome.recv_timeout(__deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", __deadline)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn parse_timeout(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit = syn::parse2::<LitInt>(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated harness.
fn is_test_marker(attr: &Attribute) -> bool {
    let path: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    path == ["test"] || path == ["tokio", "test"]
}
