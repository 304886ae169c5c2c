//! `#[timeout]` and `#[tokio_timeout_test]` run a test body on a watchdog
//! thread and fail the test when it outlives the limit (default 60s, or the
//! integer seconds given as the attribute argument).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_LIMIT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match limit_secs(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "use tokio_timeout_test for async test functions",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip(attrs, |path| path == ["test"]);
    let run = quote! { #block };
    let body = watchdog(limit, run);
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig #body
    }
    .into()
}

/// Also replaces `#[tokio::test]`; the body runs on a fresh current-thread
/// runtime with every driver enabled.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match limit_secs(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test requires an async function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip(attrs, |path| path == ["tokio", "test"]);
    let run = quote! {{
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("tokio runtime for test");
        runtime.block_on(async {
            if tokio::time::timeout(limit, async move #block).await.is_err() {
                panic!("test exceeded {}s", limit.as_secs());
            }
        });
    }};
    let body = watchdog(limit, run);
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig #body
    }
    .into()
}

fn limit_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_LIMIT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be at least one second"));
    }
    Ok(secs)
}

fn strip(attrs: Vec<Attribute>, matches: impl Fn(&[String]) -> bool) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let path: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches(&path)
        })
        .collect()
}

/// Runs `run` on its own thread and re-raises its panic, or panics itself
/// when the thread has not reported back within `limit` seconds.
fn watchdog(limit: u64, run: TokenStream2) -> TokenStream2 {
    quote! {{
        let limit = std::time::Duration::from_secs(#limit);
        let (report, outcome) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || #run));
            let _ = report.send(result);
        });
        match outcome.recv_timeout(limit) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded {}s", limit.as_secs())
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }}
}
