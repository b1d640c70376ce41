use std::fmt;

use proc_macro::TokenStream;
use quote::quote;

enum Visibility {
    Public(proc_macro2::Span),
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public(..) => "public",
            Self::Private => "private",
        }
        .fmt(f)
    }
}

impl syn::parse::Parse for Visibility {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let identifier = input.parse::<syn::Ident>()?;
        match identifier.to_string().as_str() {
            "public" => Ok(Self::Public(identifier.span())),
            "private" => Ok(Self::Private),
            _ => Err(syn::Error::new_spanned(
                identifier,
                "Unexpected visibility: expected `public` or `private`",
            )),
        }
    }
}

struct EnumTagsArgs {
    visibility: Visibility,
    repr_type: syn::Type,
}

impl syn::parse::Parse for EnumTagsArgs {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        mod kw {
            use syn::custom_keyword;

            custom_keyword!(repr);
        }

        let visibility = input.parse()?;

        input.parse::<syn::Token![,]>().map_err(|mut error| {
            error.combine(syn::Error::new(
                input.span(),
                format!("Missing comma after `{}` visibility", visibility),
            ));
            error
        })?;

        input.parse::<kw::repr>().map_err(|mut error| {
            error.combine(syn::Error::new(
                input.span(),
                format!("Missing `repr` after `{},`", visibility),
            ));
            error
        })?;

        let content;
        syn::parenthesized!(content in input);
        let repr_type = content.parse()?;

        Ok(Self {
            visibility,
            repr_type,
        })
    }
}

/// A variant's mnemonic is its name in lowercase, unless overridden with
/// `#[mnemonic = "..."]`. The attribute is consumed here.
fn take_mnemonic(variant: &mut syn::Variant) -> syn::Result<String> {
    let mut mnemonic = variant.ident.to_string().to_ascii_lowercase();
    let mut error = None;
    variant.attrs.retain(|attribute| {
        if !attribute.path().is_ident("mnemonic") {
            return true;
        }
        match &attribute.meta {
            syn::Meta::NameValue(syn::MetaNameValue {
                value:
                    syn::Expr::Lit(syn::ExprLit {
                        lit: syn::Lit::Str(text),
                        ..
                    }),
                ..
            }) => mnemonic = text.value(),
            other => {
                error = Some(syn::Error::new_spanned(
                    other,
                    "Expected `#[mnemonic = \"...\"]`",
                ))
            }
        }
        false
    });
    match error {
        Some(error) => Err(error),
        None => Ok(mnemonic),
    }
}

fn impl_enum_tags(
    enum_visibility: syn::Visibility,
    enum_name: &syn::Ident,
    repr_type: syn::Type,
    variants: &mut syn::punctuated::Punctuated<syn::Variant, syn::Token![,]>,
) -> proc_macro2::TokenStream {
    let mut tag_idents = vec![];
    let mut tag_cases = vec![];
    let mut from_tag_cases = vec![];
    let mut mnemonic_cases = vec![];
    let mut from_mnemonic_cases = vec![];
    let mut unit_variants = vec![];
    let mut all_unit = true;
    let mut discriminant = 0;

    for variant in variants.iter_mut() {
        let mnemonic = match take_mnemonic(variant) {
            Ok(mnemonic) => mnemonic,
            Err(error) => return error.into_compile_error(),
        };
        let variant_name = variant.ident.clone();
        let tag_ident = quote::format_ident!(
            "{}_TAG",
            variant_name.to_string().to_ascii_uppercase()
        );

        if let Some((_, custom_discriminant)) = &variant.discriminant {
            match custom_discriminant {
                syn::Expr::Lit(syn::ExprLit {
                    lit: syn::Lit::Int(int_literal),
                    ..
                }) => match int_literal.base10_parse::<usize>() {
                    Ok(int_literal) => discriminant = int_literal,
                    Err(error) => {
                        return error.into_compile_error();
                    }
                },
                other => {
                    return syn::Error::new_spanned(
                        other,
                        "Only literal discriminants are allowed",
                    )
                    .into_compile_error();
                }
            }
        }

        let literal = proc_macro2::Literal::usize_unsuffixed(discriminant);

        tag_idents.push(quote! {
            #[doc = concat!("`#[enum_tags]`-generated tag for the variant `Self::", stringify!(#variant_name), "`.")]
            #enum_visibility const #tag_ident: #repr_type = #literal;
        });

        match variant.fields {
            syn::Fields::Named(_) => {
                all_unit = false;
                tag_cases.push(quote! {
                    Self::#variant_name { .. } => #literal
                });
            }
            syn::Fields::Unnamed(_) => {
                all_unit = false;
                tag_cases.push(quote! {
                    Self::#variant_name(..) => #literal
                });
            }
            syn::Fields::Unit => {
                tag_cases.push(quote! {
                    Self::#variant_name => #literal
                });
                from_tag_cases.push(quote! {
                    #literal => Some(Self::#variant_name)
                });
                mnemonic_cases.push(quote! {
                    Self::#variant_name => #mnemonic
                });
                from_mnemonic_cases.push(quote! {
                    #mnemonic => Some(Self::#variant_name)
                });
                unit_variants.push(quote! { Self::#variant_name });
            }
        }

        discriminant += 1;
    }

    let unit_impl = if all_unit {
        let count = unit_variants.len();
        quote! {
            #[doc = "`#[enum_tags]`-generated list of every variant in declaration order."]
            #enum_visibility const ALL: [Self; #count] = [#(#unit_variants),*];

            #[doc = "`#[enum_tags]`-generated inverse of [`Self::tag`]."]
            #enum_visibility const fn from_tag(tag: #repr_type) -> Option<Self> {
                match tag {
                    #(#from_tag_cases,)*
                    _ => None,
                }
            }

            #[doc = "`#[enum_tags]`-generated textual name of this variant."]
            #enum_visibility const fn mnemonic(&self) -> &'static str {
                match self {
                    #(#mnemonic_cases),*
                }
            }

            #[doc = "`#[enum_tags]`-generated inverse of [`Self::mnemonic`]."]
            #enum_visibility fn from_mnemonic(text: &str) -> Option<Self> {
                match text {
                    #(#from_mnemonic_cases,)*
                    _ => None,
                }
            }
        }
    } else {
        quote! {}
    };

    quote! {
        impl #enum_name {
            #(#tag_idents)*

            #[doc = "`#[enum_tags]`-generated getter for this variant's tag."]
            #enum_visibility const fn tag(&self) -> #repr_type {
                match self {
                    #(#tag_cases),*
                }
            }

            #unit_impl
        }
    }
}

/// Constructs an `impl` for the given `enum` with constants for the
/// discriminant value of each variant. When every variant is a unit variant,
/// the `impl` also converts back from tags and to and from mnemonics.
///
/// Usage examples:
///
/// * `#[enum_tags(public, repr(u8))]`
/// * `#[enum_tags(private, repr(u32))]`
///
/// Note that the `repr` type can be any numerical type to which a `usize` can
/// be casted to implicitly with the `as` keyword --- it is not the same as the
/// type for which you may `#[repr(...)]` the `enum`.
///
/// A variant may carry `#[mnemonic = "name"]` to replace its default
/// lowercase mnemonic.
#[proc_macro_attribute]
pub fn enum_tags(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = syn::parse_macro_input!(args as EnumTagsArgs);

    let mut input_item = syn::parse_macro_input!(input as syn::DeriveInput);

    let data_enum = match &mut input_item.data {
        syn::Data::Enum(data_enum) => data_enum,
        syn::Data::Struct(syn::DataStruct {
            struct_token: syn::token::Struct { span },
            ..
        })
        | syn::Data::Union(syn::DataUnion {
            union_token: syn::token::Union { span },
            ..
        }) => {
            return syn::Error::new(*span, "Item must be an `enum`")
                .into_compile_error()
                .into();
        }
    };

    let visibility = match args.visibility {
        Visibility::Public(span) => {
            syn::Visibility::Public(syn::token::Pub { span })
        }
        Visibility::Private => syn::Visibility::Inherited,
    };

    let tags_impl = impl_enum_tags(
        visibility,
        &input_item.ident,
        args.repr_type,
        &mut data_enum.variants,
    );

    quote! {
        #input_item

        #tags_impl
    }
    .into()
}
