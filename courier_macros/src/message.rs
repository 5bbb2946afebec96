use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, LitStr};

enum Kind {
    Event,
    Command,
}

pub fn derive_message(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (type_name, kind) = match extract_attributes(&input) {
        Ok(parsed) => parsed,
        Err(err) => return err.to_compile_error().into(),
    };

    let kind = match kind {
        Kind::Event => quote! { ::courier::MessageKind::Event },
        Kind::Command => quote! { ::courier::MessageKind::Command },
    };

    let expanded = quote! {
        impl #impl_generics ::courier::Message for #name #ty_generics #where_clause {
            const TYPE_NAME: &'static str = #type_name;
            const KIND: ::courier::MessageKind = #kind;
        }
    };

    TokenStream::from(expanded)
}

fn extract_attributes(input: &DeriveInput) -> syn::Result<(String, Kind)> {
    let mut type_name = None;
    let mut kind = Kind::Event;

    for attr in &input.attrs {
        if !attr.path().is_ident("message") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                if value.value().trim().is_empty() {
                    return Err(meta.error("message type name must not be empty"));
                }
                type_name = Some(value.value());
                Ok(())
            } else if meta.path.is_ident("command") {
                kind = Kind::Command;
                Ok(())
            } else if meta.path.is_ident("event") {
                kind = Kind::Event;
                Ok(())
            } else {
                Err(meta.error("expected `name = \"...\"`, `command` or `event`"))
            }
        })?;
    }

    // Default: the struct identifier
    let type_name = type_name.unwrap_or_else(|| input.ident.to_string());
    Ok((type_name, kind))
}
