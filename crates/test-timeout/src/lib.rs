use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Block, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Runs a test on a watchdog thread and fails it when it exceeds the
/// deadline. Works on both plain and `async` test functions; async bodies
/// run on a fresh current-thread Tokio runtime, so the test crate must
/// depend on `tokio` with the `rt` and `time` features.
///
/// ```ignore
/// #[test_timeout::timeout]
/// fn sync_case() {}
///
/// #[test_timeout::timeout(5)]
/// async fn async_case() {}
/// ```
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = if attr.is_empty() {
        DEFAULT_TIMEOUT_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into()
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_harness_attribute(attr))
        .collect();

    let body = if sig.asyncness.take().is_some() {
        async_body(&block, timeout_secs)
    } else {
        quote! { #block }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = ::std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let result = ::std::panic::catch_unwind(
                    ::std::panic::AssertUnwindSafe(|| #body),
                );
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s timeout", #timeout_secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

fn async_body(block: &Block, timeout_secs: u64) -> TokenStream2 {
    quote! {{
        let runtime = ::tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            ::tokio::time::timeout(
                ::std::time::Duration::from_secs(#timeout_secs),
                async move #block,
            )
            .await
            .expect("test timed out");
        })
    }}
}

// `#[test]`, `#[tokio::test]` and `#[tokio::test(...)]` would double-register
// the function with the harness.
fn is_test_harness_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
