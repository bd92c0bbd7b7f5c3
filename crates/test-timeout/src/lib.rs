//! Wall-clock deadlines for tests.
//!
//! `#[tokio_timeout_test(secs)]` turns an async fn into a `#[test]` running
//! on its own runtime; `#[tokio_timeout_test(secs, multi_thread)]` uses a
//! multi-threaded one. `#[timeout(secs)]` does the same for synchronous
//! tests. Either way the body runs on a watchdog thread and the test fails
//! once the deadline passes. Set `MC_TUNNEL_TEST_TIMEOUT_SCALE` to a
//! positive integer to stretch every deadline on slow machines.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct TimeoutArgs {
    secs: u64,
    multi_thread: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            multi_thread: false,
        };
        if input.is_empty() {
            return Ok(args);
        }
        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = lit.base10_parse()?;
            if args.secs == 0 {
                return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
            }
            if input.is_empty() {
                return Ok(args);
            }
            input.parse::<Token![,]>()?;
        }
        let flavor: Ident = input.parse()?;
        match flavor.to_string().as_str() {
            "multi_thread" => args.multi_thread = true,
            "current_thread" => args.multi_thread = false,
            _ => {
                return Err(syn::Error::new_spanned(
                    flavor,
                    "expected `multi_thread` or `current_thread`",
                ));
            }
        }
        if !input.is_empty() {
            return Err(input.error("unexpected tokens after runtime flavor"));
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let builder = if args.multi_thread {
        quote!(tokio::runtime::Builder::new_multi_thread().worker_threads(2))
    } else {
        quote!(tokio::runtime::Builder::new_current_thread())
    };
    let name = sig.ident.to_string();
    let body = quote! {
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            if tokio::time::timeout(timeout_duration, async move #block).await.is_err() {
                panic!("{} timed out after {:?}", #name, timeout_duration);
            }
        });
    };
    let watchdog = watchdog(args.secs, &name, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let name = sig.ident.to_string();
    let watchdog = watchdog(args.secs, &name, quote!(#block));

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

/// Runs `body` on a fresh thread and waits for it up to the (scaled)
/// deadline, re-raising its panic if it had one.
fn watchdog(secs: u64, name: &str, body: TokenStream2) -> TokenStream2 {
    quote! {
        let scale: u32 = std::env::var("MC_TUNNEL_TEST_TIMEOUT_SCALE")
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|scale| *scale > 0)
            .unwrap_or(1);
        let timeout_duration = std::time::Duration::from_secs(#secs) * scale;
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name(format!("{}-watchdog", #name))
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            })
            .expect("failed to spawn test thread");
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("{} timed out after {:?}", #name, timeout_duration)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("{} failed before reporting a result", #name)
            }
        }
    }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
