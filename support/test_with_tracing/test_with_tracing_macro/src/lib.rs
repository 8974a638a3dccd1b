// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attribute macro backing `test_with_tracing::test`.

use quote::quote;
use syn::parse_macro_input;
use syn::spanned::Spanned;
use syn::Error;
use syn::ItemFn;

/// Marks a test whose `tracing` output should be captured.
///
/// Expands to a `#[test]` wrapper that initializes the subscriber and then
/// calls the original function, so `should_panic` and friends keep working.
#[proc_macro_attribute]
pub fn test(
    _attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    wrap_test(item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn wrap_test(item: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    if let Some(asyncness) = &item.sig.asyncness {
        return Err(Error::new(
            asyncness.span(),
            "tracing tests must be synchronous",
        ));
    }
    if !item.sig.inputs.is_empty() {
        return Err(Error::new(
            item.sig.inputs.span(),
            "tracing tests take no arguments",
        ));
    }

    let name = &item.sig.ident;
    let output = &item.sig.output;
    let attrs = &item.attrs;

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        fn #name() #output {
            #item
            ::test_with_tracing::init();
            #name()
        }
    })
}
